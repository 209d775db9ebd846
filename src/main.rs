use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use netherd::config::{ConnectionDefaults, ControllerConfig, NetherdConfig, WorkerConfig};
use netherd::controller::Controller;
use netherd::coordination::InProcessBus;
use netherd::datastore::DatasourceConfig;
use netherd::inventory::Aggregator;
use netherd::registry::SessionMode;
use netherd::shutdown::install_shutdown_handler;
use netherd::worker::{TcpSessionFactory, Worker};

#[derive(Parser, Debug)]
#[command(name = "netherd")]
#[command(version)]
#[command(about = "Distributes persistent NETCONF device sessions across a worker pool")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a controller with an in-process worker pool
    Run(RunArgs),

    /// Load the configured datastores once and print the aggregated targets
    Inventory(InventoryArgs),
}

#[derive(Parser, Debug)]
struct DatasourceArgs {
    /// CSV inventory file(s) (header: host,port,username,password,filter,mode)
    #[arg(long = "file")]
    files: Vec<PathBuf>,

    /// Remote inventory API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Remote inventory API token
    #[arg(long, requires = "api_url")]
    api_token: Option<String>,

    /// Device filter forwarded to the API, "key=value", repeatable
    #[arg(long = "api-filter", requires = "api_url")]
    api_filters: Vec<String>,

    /// Require a primary IPv6 address on API-sourced devices
    #[arg(long, requires = "api_url")]
    prefer_ipv6: bool,

    /// Default NETCONF port for targets that do not specify one
    #[arg(long, default_value = "830")]
    default_port: u16,

    /// Default credentials for targets that do not carry their own
    #[arg(long)]
    default_username: Option<String>,

    #[arg(long)]
    default_password: Option<String>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    datasources: DatasourceArgs,

    /// Number of in-process workers
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Concurrent sessions per worker
    #[arg(long, default_value = "15")]
    capacity: usize,

    /// Worker check-in cadence in seconds
    #[arg(long, default_value = "300")]
    checkin_interval_secs: u64,

    /// Check in early after this many session events
    #[arg(long, default_value = "1200")]
    max_events_before_checkin: u64,

    /// How long an unacked claim stays pending, in seconds
    #[arg(long, default_value = "5")]
    claim_timeout_secs: u64,

    /// Session connect timeout in seconds
    #[arg(long, default_value = "30")]
    connect_timeout_secs: u64,

    /// Re-run inventory aggregation at this cadence, in seconds
    #[arg(long)]
    refresh_interval_secs: Option<u64>,

    /// Coordination broker connection string. `in-process` runs the bundled
    /// single-process bus.
    #[arg(long, default_value = "in-process")]
    broker: String,
}

#[derive(Parser, Debug)]
struct InventoryArgs {
    #[command(flatten)]
    datasources: DatasourceArgs,
}

fn build_config(args: &DatasourceArgs) -> Result<NetherdConfig, String> {
    let mut config = NetherdConfig {
        defaults: ConnectionDefaults {
            port: args.default_port,
            username: args.default_username.clone(),
            password: args.default_password.clone(),
            mode: SessionMode::Default,
            ..Default::default()
        },
        ..Default::default()
    };

    for path in &args.files {
        config = config.with_datasource(DatasourceConfig::File { path: path.clone() });
    }

    if let Some(url) = &args.api_url {
        let mut device_filter = BTreeMap::new();
        for pair in &args.api_filters {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("bad --api-filter '{pair}', expected key=value"))?;
            device_filter.insert(key.to_string(), value.to_string());
        }
        config = config.with_datasource(DatasourceConfig::Api {
            url: url.clone(),
            token: args.api_token.clone(),
            device_filter,
            prefer_ipv6: args.prefer_ipv6,
        });
    }

    if config.datasources.is_empty() {
        return Err("no datasources configured; pass --file and/or --api-url".into());
    }
    Ok(config)
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = build_config(&args.datasources)?;
    config.controller = ControllerConfig {
        claim_timeout: Duration::from_secs(args.claim_timeout_secs),
        checkin_interval: Duration::from_secs(args.checkin_interval_secs),
        refresh_interval: args.refresh_interval_secs.map(Duration::from_secs),
        ..Default::default()
    };
    config.worker = WorkerConfig {
        capacity: args.capacity,
        checkin_interval: Duration::from_secs(args.checkin_interval_secs),
        max_events_before_checkin: args.max_events_before_checkin,
        ..Default::default()
    };
    config.defaults.connect_timeout = Duration::from_secs(args.connect_timeout_secs);
    config.broker_url = args.broker.clone();

    if args.broker != "in-process" {
        return Err(format!(
            "unsupported broker '{}'; only the in-process bus is built in",
            args.broker
        )
        .into());
    }

    let shutdown = install_shutdown_handler();
    let bus = Arc::new(InProcessBus::new());

    let aggregator = Aggregator::new(&config.datasources, &config.defaults, &config.controller);
    let controller = Controller::new(config.controller.clone(), bus.clone(), aggregator);
    let controller_handle = tokio::spawn(controller.run(shutdown.clone()));

    let mut worker_handles = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        let factory = Arc::new(TcpSessionFactory::new(config.defaults.connect_timeout));
        let worker = Worker::new(config.worker.clone(), bus.clone(), factory);
        worker_handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    tracing::info!(workers = args.workers, capacity = args.capacity, "netherd running");

    for handle in worker_handles {
        if let Err(err) = handle.await? {
            tracing::error!(error = %err, "Worker exited with error");
        }
    }
    controller_handle.await??;
    Ok(())
}

async fn inventory(args: InventoryArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args.datasources)?;
    let aggregator = Aggregator::new(&config.datasources, &config.defaults, &config.controller);
    let specs = aggregator.collect().await;

    println!("{} target(s):", specs.len());
    for spec in specs {
        println!(
            "  {}:{} user={} mode={}",
            spec.host,
            spec.port,
            spec.username.as_deref().unwrap_or("-"),
            spec.mode
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run(run_args) => run(run_args).await,
        Commands::Inventory(inventory_args) => inventory(inventory_args).await,
    }
}
