// src/scheduler.rs
//
// Inter-arrival admission control for the driver's dispatch loop. Controls
// the rate at which requests are issued, not the rate at which they complete.
//
// Distributions:
// - Exponential: Poisson arrivals, sampled per dispatch with tokio::sleep
// - Uniform: tokio interval with drift compensation
// - Constant: exact delay computed against the start of the run

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrivalDistribution {
    Exponential,
    Uniform,
    Constant,
}

pub struct InterArrivalScheduler {
    distribution: ArrivalDistribution,
    inter_arrival_micros: f64,
    exp_dist: Option<Exp<f64>>,
    rng: Mutex<StdRng>,
    uniform_interval: Mutex<Option<Interval>>,
    started: Instant,
    issued: AtomicU64,
}

impl InterArrivalScheduler {
    pub fn new(ops_per_second: f64, distribution: ArrivalDistribution) -> Result<Self> {
        anyhow::ensure!(
            ops_per_second.is_finite() && ops_per_second > 0.0,
            "ops_per_second must be > 0 [{}]",
            ops_per_second
        );
        let inter_arrival_micros = 1_000_000.0 / ops_per_second;

        let exp_dist = if distribution == ArrivalDistribution::Exponential {
            // mean of the exponential is the inter-arrival time
            Some(Exp::new(1.0 / inter_arrival_micros)?)
        } else {
            None
        };

        let uniform_interval = if distribution == ArrivalDistribution::Uniform {
            let mut timer = interval(Duration::from_micros(inter_arrival_micros as u64));
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Mutex::new(Some(timer))
        } else {
            Mutex::new(None)
        };

        Ok(InterArrivalScheduler {
            distribution,
            inter_arrival_micros,
            exp_dist,
            rng: Mutex::new(StdRng::seed_from_u64(rand::random())),
            uniform_interval,
            started: Instant::now(),
            issued: AtomicU64::new(0),
        })
    }

    /// Waits until the next request may be issued.
    pub async fn wait_for_next(&self) {
        match self.distribution {
            ArrivalDistribution::Exponential => {
                let delay_micros = {
                    let mut rng = self.rng.lock().await;
                    match &self.exp_dist {
                        Some(dist) => dist.sample(&mut *rng),
                        None => 0.0,
                    }
                };
                if delay_micros > 0.0 {
                    sleep(Duration::from_micros(delay_micros as u64)).await;
                }
            }
            ArrivalDistribution::Uniform => {
                let mut guard = self.uniform_interval.lock().await;
                if let Some(timer) = guard.as_mut() {
                    timer.tick().await;
                }
            }
            ArrivalDistribution::Constant => {
                let ops = self.issued.fetch_add(1, Ordering::Relaxed);
                let target_micros = ops as f64 * self.inter_arrival_micros;
                let elapsed_micros = self.started.elapsed().as_micros() as f64;
                let delay = target_micros - elapsed_micros;
                if delay > 0.0 {
                    sleep(Duration::from_micros(delay as u64)).await;
                }
            }
        }
    }

    /// Achieved issue rate so far, for the summary.
    pub fn current_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.issued.load(Ordering::Relaxed) as f64 / elapsed
    }
}
