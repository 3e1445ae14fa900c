// src/size_generator.rs
//
// Object size selection: fixed, uniform, or lognormal. Lognormal parameters
// are given in linear space (mean, std-dev in bytes) and converted to
// log-space before sampling.

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, LogNormal, Uniform};
use serde::Deserialize;

/// Size specification as it appears in the workload config.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Fixed(u64),
    Distribution(SizeDistribution),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizeDistribution {
    #[serde(rename = "type")]
    pub dist_type: DistributionType,
    #[serde(default)]
    pub min: Option<u64>,
    #[serde(default)]
    pub max: Option<u64>,
    #[serde(default)]
    pub mean: Option<u64>,
    #[serde(default)]
    pub std_dev: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistributionType {
    Uniform,
    Lognormal,
}

pub struct SizeGenerator {
    kind: Kind,
    rng: StdRng,
}

enum Kind {
    Fixed(u64),
    Uniform(Uniform<u64>),
    LogNormal { dist: LogNormal<f64>, min: u64, max: u64 },
}

impl SizeGenerator {
    pub fn new(spec: &SizeSpec) -> Result<Self> {
        Self::with_seed(spec, rand::random())
    }

    /// Same seed and spec yield the same size sequence.
    pub fn with_seed(spec: &SizeSpec, seed: u64) -> Result<Self> {
        let kind = match spec {
            SizeSpec::Fixed(size) => Kind::Fixed(*size),
            SizeSpec::Distribution(d) => match d.dist_type {
                DistributionType::Uniform => {
                    let min = d.min.ok_or_else(|| anyhow!("uniform size requires 'min'"))?;
                    let max = d.max.ok_or_else(|| anyhow!("uniform size requires 'max'"))?;
                    if min > max {
                        return Err(anyhow!("uniform size: min ({}) > max ({})", min, max));
                    }
                    Kind::Uniform(
                        Uniform::new_inclusive(min, max)
                            .context("failed to build uniform size distribution")?,
                    )
                }
                DistributionType::Lognormal => {
                    let mean = d
                        .mean
                        .filter(|m| *m > 0)
                        .ok_or_else(|| anyhow!("lognormal size requires 'mean' > 0"))?;
                    let std_dev = d
                        .std_dev
                        .filter(|s| *s > 0)
                        .ok_or_else(|| anyhow!("lognormal size requires 'std_dev' > 0"))?;
                    let min = d.min.unwrap_or(1);
                    let max = d.max.unwrap_or(u64::MAX);
                    if min > max {
                        return Err(anyhow!("lognormal size: min ({}) > max ({})", min, max));
                    }
                    // linear mean/variance -> log-space mu/phi:
                    //   phi^2 = ln(1 + var/mean^2), mu = ln(mean) - phi^2/2
                    let mean_f = mean as f64;
                    let var = (std_dev as f64) * (std_dev as f64);
                    let phi_squared = (1.0 + var / (mean_f * mean_f)).ln();
                    let mu = mean_f.ln() - phi_squared / 2.0;
                    Kind::LogNormal {
                        dist: LogNormal::new(mu, phi_squared.sqrt())
                            .context("failed to build lognormal size distribution")?,
                        min,
                        max,
                    }
                }
            },
        };
        Ok(SizeGenerator {
            kind,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn generate(&mut self) -> u64 {
        match &self.kind {
            Kind::Fixed(size) => *size,
            Kind::Uniform(dist) => dist.sample(&mut self.rng),
            Kind::LogNormal { dist, min, max } => {
                let sample = dist.sample(&mut self.rng).round() as u64;
                sample.clamp(*min, *max)
            }
        }
    }
}
