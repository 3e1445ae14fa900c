//
// ogen - object-storage workload generator
//
// Produces a weighted stream of signed S3-style requests, maintains a
// persistent population of written objects so reads and deletes always
// reference real names, and reports per-operation statistics.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use ogen::auth::v2::AwsV2Auth;
use ogen::body::DataType;
use ogen::auth::v4::{AwsV4Auth, PayloadMode};
use ogen::auth::{HttpAuth, NoAuth};
use ogen::client::HttpClient;
use ogen::conditions::StoppingCondition;
use ogen::config::{
    AuthConfig, Config, FillKind, OpSpec, PayloadConfig, RangeMode, ShutdownConfig,
};
use ogen::driver::{LoadTest, RequestSource, ShutdownMode, ShutdownToken, SupplierSource};
use ogen::events::{EventBus, PopulationSubscriber, Subscriber};
use ogen::multipart::MultipartRequestSupplier;
use ogen::objects::ObjectManager;
use ogen::request::{Credential, Method, Operation};
use ogen::request_supplier::{BodyKind, RequestSupplier};
use ogen::scheduler::InterArrivalScheduler;
use ogen::size_generator::SizeGenerator;
use ogen::stats::{Statistics, StatsSubscriber};
use ogen::suppliers::{ContextProducer, Mode, ObjectNameSource, ValueSupplier};

const EXIT_SUCCESS: i32 = 0;
const EXIT_CONFIGURATION: i32 = 1;
const EXIT_ABORTED: i32 = 2;

const LINE: &str =
    "-------------------------------------------------------------------------------";

#[derive(Parser)]
#[command(name = "ogen", version, about = "Object-storage workload generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload from a YAML config file
    Run {
        #[arg(long)]
        config: PathBuf,

        /// Parse and validate the config, then exit without executing
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let code = match cli.command {
        Commands::Run { config, dry_run } => run_command(&config, dry_run),
    };
    std::process::exit(code);
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_command(path: &Path, dry_run: bool) -> i32 {
    println!("{}\nogen {}\n{}", LINE, env!("CARGO_PKG_VERSION"), LINE);

    let config = match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {:#}", err);
            eprintln!("configuration error: {:#}", err);
            return EXIT_CONFIGURATION;
        }
    };
    if dry_run {
        println!(
            "config ok: {} operation(s), concurrency {}",
            config.workload.len(),
            config.concurrency
        );
        return EXIT_SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {}", err);
            return EXIT_CONFIGURATION;
        }
    };
    match runtime.block_on(run_test(config)) {
        Ok(false) => EXIT_SUCCESS,
        Ok(true) => {
            eprintln!("test aborted; check the log for details");
            EXIT_ABORTED
        }
        Err(err) => {
            error!("error provisioning the test: {:#}", err);
            eprintln!("configuration error: {:#}", err);
            EXIT_CONFIGURATION
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    Config::from_yaml(&text)
}

async fn run_test(config: Config) -> Result<bool> {
    info!("configuring...");
    let manager = Arc::new(
        ObjectManager::load(&config.object_store.directory, &config.object_store.prefix)
            .context("failed to load object population")?,
    );
    let shutdown = ShutdownToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping");
                shutdown.stop();
            }
        });
    }

    let stats = Arc::new(Statistics::new());
    let mut bus = EventBus::new();
    bus.subscribe(Arc::new(PopulationSubscriber::new(
        manager.clone(),
        config.object_store.shards,
    )));

    let mut sources: Vec<(Arc<dyn RequestSource>, u32)> = Vec::new();
    for entry in &config.workload {
        let source = build_source(&config, entry, &manager, &shutdown)?;
        if let Built::Multipart(supplier) = &source {
            bus.subscribe(supplier.clone() as Arc<dyn Subscriber>);
        }
        sources.push((source.into_source(), entry.weight));
    }
    bus.subscribe(Arc::new(StatsSubscriber::new(stats.clone())));

    let client = Arc::new(HttpClient::new(build_auth(&config), None)?);
    let scheduler = match &config.rate {
        Some(rate) => Some(Arc::new(InterArrivalScheduler::new(
            rate.ops_per_second,
            rate.distribution,
        )?)),
        None => None,
    };
    let shutdown_mode = match config.shutdown {
        ShutdownConfig::Graceful => ShutdownMode::Graceful,
        ShutdownConfig::Immediate => ShutdownMode::Immediate,
    };

    let test = LoadTest::new(
        sources,
        client,
        bus,
        stats.clone(),
        build_conditions(&config),
        shutdown,
        config.concurrency,
        scheduler,
        shutdown_mode,
    )?
    .with_progress(true);

    info!("configured, running...");
    let outcome = test.run().await?;

    println!("{}\nSummary\n{}", LINE, LINE);
    println!("{}", stats.summary(outcome.elapsed));
    println!("objects in population: {}", manager.objects());

    manager
        .test_complete()
        .context("failed to persist object population")?;
    Ok(outcome.aborted)
}

enum Built {
    Single(Arc<SupplierSource>),
    Multipart(Arc<MultipartRequestSupplier>),
}

impl Built {
    fn into_source(self) -> Arc<dyn RequestSource> {
        match self {
            Built::Single(source) => source,
            Built::Multipart(supplier) => supplier,
        }
    }
}

fn build_source(
    config: &Config,
    entry: &ogen::config::WeightedOp,
    manager: &Arc<ObjectManager>,
    shutdown: &ShutdownToken,
) -> Result<Built> {
    match &entry.spec {
        OpSpec::MultipartWrite {
            size,
            part_size,
            max_concurrent_parts,
            target_sessions,
            data,
            content_md5,
        } => {
            let mut producers = vec![container_producer(config)?];
            if let Some(credentials) = credentials_producer(config) {
                producers.push(credentials);
            }
            producers.push(ContextProducer::ObjectName(ObjectNameSource::Generate));
            producers.push(ContextProducer::ObjectSize(SizeGenerator::new(size)?));
            let supplier = MultipartRequestSupplier::new(
                config.scheme,
                ValueSupplier::constant(&config.host),
                config.port,
                config.uri_root.clone(),
                producers,
                Vec::new(),
                SizeGenerator::new(part_size)?,
                *max_concurrent_parts,
                *target_sessions,
                fill_data_type(*data),
                false,
                config.virtual_host,
                *content_md5,
                shutdown.clone(),
            )?;
            Ok(Built::Multipart(Arc::new(supplier)))
        }
        spec => {
            let mut retention = None;
            let mut legal_hold = None;
            let (operation, method, name_source, size, fill, content_md5) = match spec {
                OpSpec::Write {
                    size,
                    data,
                    content_md5,
                    retention: op_retention,
                    legal_hold: op_legal_hold,
                } => {
                    retention = op_retention.clone();
                    legal_hold = op_legal_hold.clone();
                    (
                        Operation::Write,
                        Method::Put,
                        Some(ObjectNameSource::Generate),
                        Some(size.clone()),
                        *data,
                        *content_md5,
                    )
                }
                OpSpec::Overwrite { size, data } => (
                    Operation::Overwrite,
                    Method::Put,
                    Some(ObjectNameSource::ForRead(manager.clone())),
                    Some(size.clone()),
                    *data,
                    false,
                ),
                OpSpec::Read => (
                    Operation::Read,
                    Method::Get,
                    Some(ObjectNameSource::ForRead(manager.clone())),
                    None,
                    FillKind::Zeroes,
                    false,
                ),
                OpSpec::Delete => (
                    Operation::Delete,
                    Method::Delete,
                    Some(ObjectNameSource::ForDelete(manager.clone())),
                    None,
                    FillKind::Zeroes,
                    false,
                ),
                OpSpec::Head => (
                    Operation::Head,
                    Method::Head,
                    Some(ObjectNameSource::ForRead(manager.clone())),
                    None,
                    FillKind::Zeroes,
                    false,
                ),
                OpSpec::MetadataRead => (
                    Operation::MetadataRead,
                    Method::Get,
                    None,
                    None,
                    FillKind::Zeroes,
                    false,
                ),
                OpSpec::MultipartWrite { .. } => unreachable!("handled above"),
            };

            let mut producers = vec![
                ContextProducer::RequestId { next: 0 },
                container_producer(config)?,
            ];
            if let Some(credentials) = credentials_producer(config) {
                producers.push(credentials);
            }
            if let Some(source) = name_source {
                producers.push(ContextProducer::ObjectName(source));
            }
            let body = match (&size, fill) {
                (None, _) => BodyKind::None,
                (Some(_), FillKind::Zeroes) => BodyKind::Zeroes,
                (Some(_), FillKind::Random) => BodyKind::Random,
            };
            if let Some(size) = size {
                producers.push(ContextProducer::ObjectSize(SizeGenerator::new(&size)?));
            }
            if let Some(retention) = retention {
                producers.push(ContextProducer::Retention(ValueSupplier::constant(retention)));
            }
            if let Some(legal_hold) = legal_hold {
                producers.push(ContextProducer::LegalHold(ValueSupplier::constant(legal_hold)));
            }

            let supplier = RequestSupplier::new(
                operation,
                method,
                config.scheme,
                ValueSupplier::constant(&config.host),
                config.port,
                config.uri_root.clone(),
                config.api_version.clone(),
                producers,
                Vec::new(),
                Vec::new(),
                false,
                config.virtual_host,
                body,
                content_md5,
            );
            Ok(Built::Single(Arc::new(SupplierSource::new(
                supplier,
                shutdown.clone(),
            ))))
        }
    }
}

fn fill_data_type(fill: FillKind) -> DataType {
    match fill {
        FillKind::Zeroes => DataType::Zeroes,
        FillKind::Random => DataType::Random,
    }
}

fn container_producer(config: &Config) -> Result<ContextProducer> {
    let base = ValueSupplier::constant(&config.container.prefix);
    let suffix = match &config.container.suffix {
        Some(range) => {
            let mode = match range.mode {
                RangeMode::Cycle => Mode::Cycle,
                RangeMode::Random => Mode::Random,
            };
            Some(ValueSupplier::ranged(range.min, range.max, mode)?)
        }
        None => None,
    };
    Ok(ContextProducer::ContainerName { base, suffix })
}

fn credentials_producer(config: &Config) -> Option<ContextProducer> {
    if config.credentials.is_empty() {
        return None;
    }
    let accounts = config
        .credentials
        .iter()
        .map(|c| Credential {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            keystone_token: c.keystone_token.clone(),
            storage_account_name: c.storage_account_name.clone(),
        })
        .collect();
    Some(ContextProducer::Credentials { accounts, next: 0 })
}

fn build_auth(config: &Config) -> Arc<dyn HttpAuth> {
    match &config.auth {
        AuthConfig::None => Arc::new(NoAuth),
        AuthConfig::Awsv2 => Arc::new(AwsV2Auth::new()),
        AuthConfig::Awsv4 {
            region,
            service,
            payload,
            chunk_size,
        } => {
            let mode = match payload {
                PayloadConfig::Signed => PayloadMode::Signed,
                PayloadConfig::Unsigned => PayloadMode::Unsigned,
                PayloadConfig::Chunked => PayloadMode::Chunked {
                    chunk_size: *chunk_size,
                },
            };
            Arc::new(AwsV4Auth::with_payload_mode(region, service, mode))
        }
    }
}

fn build_conditions(config: &Config) -> Vec<StoppingCondition> {
    let mut conditions = Vec::new();
    if let Some(runtime) = config.stop.runtime {
        conditions.push(StoppingCondition::Runtime(runtime));
    }
    if let Some(operations) = config.stop.operations {
        conditions.push(StoppingCondition::TotalOperations(operations));
    }
    if let Some(aborts) = config.stop.aborts {
        conditions.push(StoppingCondition::TotalAborts(aborts));
    }
    for stop in &config.stop.status_codes {
        conditions.push(StoppingCondition::StatusCodeCount {
            status_code: stop.code,
            count: stop.count,
        });
    }
    conditions
}
