// src/config.rs
//
// Declarative workload description, deserialized from YAML. Validation is a
// single pass at startup; any failure is a configuration error and the
// process exits with code 1 before a single request is produced.

use serde::Deserialize;

use crate::scheduler::ArrivalDistribution;
use crate::size_generator::SizeSpec;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheme: Scheme,

    /// Target host or address; one request host per test.
    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,

    /// Base path segment, e.g. `s3` or `soh`.
    #[serde(default)]
    pub uri_root: Option<String>,

    #[serde(default)]
    pub api_version: Option<String>,

    /// Virtual-host style addressing (container becomes a host label).
    #[serde(default)]
    pub virtual_host: bool,

    /// Concurrent in-flight requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,

    pub object_store: ObjectStoreConfig,

    pub container: ContainerConfig,

    /// Optional inter-arrival admission control; absent means the
    /// concurrency cap alone limits the request rate.
    #[serde(default)]
    pub rate: Option<RateConfig>,

    #[serde(default)]
    pub stop: StopConfig,

    pub workload: Vec<WeightedOp>,
}

fn default_concurrency() -> usize {
    16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownConfig {
    #[default]
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Awsv2,
    Awsv4 {
        region: String,
        service: String,
        #[serde(default)]
        payload: PayloadConfig,
        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
    },
}

fn default_chunk_size() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadConfig {
    #[default]
    Signed,
    Unsigned,
    Chunked,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub keystone_token: Option<String>,
    #[serde(default)]
    pub storage_account_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    pub directory: std::path::PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_shards")]
    pub shards: u8,
}

fn default_prefix() -> String {
    "og".to_string()
}

fn default_shards() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    /// Container name, or name prefix when a suffix range is configured.
    pub prefix: String,
    #[serde(default)]
    pub suffix: Option<RangeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangeConfig {
    pub min: u64,
    pub max: u64,
    #[serde(default)]
    pub mode: RangeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RangeMode {
    Cycle,
    #[default]
    Random,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateConfig {
    pub ops_per_second: f64,
    #[serde(default = "default_distribution")]
    pub distribution: ArrivalDistribution,
}

fn default_distribution() -> ArrivalDistribution {
    ArrivalDistribution::Exponential
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StopConfig {
    /// Wall-time limit, e.g. "60s", "5m".
    #[serde(default, with = "humantime_serde")]
    pub runtime: Option<std::time::Duration>,
    #[serde(default)]
    pub operations: Option<u64>,
    #[serde(default)]
    pub aborts: Option<u64>,
    #[serde(default)]
    pub status_codes: Vec<StatusCodeStop>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusCodeStop {
    pub code: u16,
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightedOp {
    pub weight: u32,
    #[serde(flatten)]
    pub spec: OpSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpSpec {
    /// PUT a fresh object.
    Write {
        size: SizeSpec,
        #[serde(default)]
        data: FillKind,
        #[serde(default)]
        content_md5: bool,
        /// Retention period, forwarded as a request header.
        #[serde(default)]
        retention: Option<String>,
        /// Legal hold name, forwarded as a request header.
        #[serde(default)]
        legal_hold: Option<String>,
    },
    /// GET an existing object.
    Read,
    /// PUT over an existing object.
    Overwrite {
        size: SizeSpec,
        #[serde(default)]
        data: FillKind,
    },
    /// DELETE an existing object.
    Delete,
    /// HEAD an existing object.
    Head,
    /// GET container metadata (listing).
    MetadataRead,
    /// Multipart upload sessions.
    MultipartWrite {
        size: SizeSpec,
        part_size: SizeSpec,
        #[serde(default = "default_max_parts")]
        max_concurrent_parts: u32,
        #[serde(default = "default_target_sessions")]
        target_sessions: u32,
        #[serde(default)]
        data: FillKind,
        #[serde(default)]
        content_md5: bool,
    },
}

fn default_max_parts() -> u32 {
    1
}

fn default_target_sessions() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FillKind {
    #[default]
    Zeroes,
    Random,
}

impl Config {
    pub fn from_yaml(text: &str) -> anyhow::Result<Config> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.host.is_empty(), "host must not be empty");
        anyhow::ensure!(self.concurrency > 0, "concurrency must be > 0");
        anyhow::ensure!(!self.workload.is_empty(), "workload must not be empty");
        anyhow::ensure!(
            self.workload.iter().map(|w| w.weight as u64).sum::<u64>() > 0,
            "workload weights sum to zero"
        );
        if let Some(rate) = &self.rate {
            anyhow::ensure!(
                rate.ops_per_second.is_finite() && rate.ops_per_second > 0.0,
                "rate.ops_per_second must be > 0 [{}]",
                rate.ops_per_second
            );
        }
        if let Some(suffix) = &self.container.suffix {
            anyhow::ensure!(
                suffix.min <= suffix.max,
                "container suffix: min ({}) > max ({})",
                suffix.min,
                suffix.max
            );
        }
        if !matches!(self.auth, AuthConfig::None) {
            anyhow::ensure!(
                !self.credentials.is_empty(),
                "auth requires at least one credential"
            );
        }
        if let AuthConfig::Awsv4 { chunk_size, .. } = &self.auth {
            anyhow::ensure!(*chunk_size > 0, "auth.chunk_size must be > 0");
        }
        if let Some(runtime) = self.stop.runtime {
            anyhow::ensure!(!runtime.is_zero(), "stop.runtime must be > 0");
        }
        for stop in &self.stop.status_codes {
            anyhow::ensure!(stop.count > 0, "stop.status_codes count must be > 0");
        }
        for entry in &self.workload {
            if let OpSpec::MultipartWrite {
                part_size,
                max_concurrent_parts,
                target_sessions,
                ..
            } = &entry.spec
            {
                if let SizeSpec::Fixed(size) = part_size {
                    anyhow::ensure!(*size > 0, "multipart part_size must be > 0");
                }
                anyhow::ensure!(
                    *max_concurrent_parts > 0,
                    "multipart max_concurrent_parts must be > 0"
                );
                anyhow::ensure!(*target_sessions > 0, "multipart target_sessions must be > 0");
            }
        }
        Ok(())
    }
}
