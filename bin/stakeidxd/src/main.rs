//! Staking indexer daemon (stakeidxd)
//!
//! Runs one sync coordinator per enabled network. Each network gets its own
//! SQLite database under `storage.path`, its own phase-cap accountant and
//! aggregate reindexer, and a cached query service that ingestion keeps
//! fresh.
//!
//! ## Usage
//!
//! ```bash
//! # Sync every enabled network
//! stakeidxd run --config stakeidx.yaml
//!
//! # Only one network, with a different data directory
//! stakeidxd run --network mainnet --data-dir /var/lib/stakeidx
//!
//! # Rebuild the aggregates of every network from its log
//! stakeidxd reindex
//!
//! # Validate the config and exit
//! stakeidxd check-config
//! ```

mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use stakeidx_chain_index::{
    AggregateReindexer, CacheInvalidation, CacheObserver, ChainIndexError, Clock,
    PersistentIndex, PhaseCapAccountant, PhaseTable, StakingQueryService, SystemClock,
};
use stakeidx_operations::config::NetworkConfig;
use stakeidx_operations::shutdown::ShutdownCoordinator;
use stakeidx_operations::startup::check_network_database;
use stakeidx_operations::{
    init_logging_from_config, run_startup, ConfigError, IndexerConfig, MetricsRegistry,
    ShutdownError, SignalHandler, StartupError, TaskGroup,
};
use stakeidx_sync::{
    ClientError, CometRpcClient, EventDecoder, Ingestor, NetworkRegistry, RetryPolicy,
    SyncCoordinator, SyncError, SyncSettings,
};
use cli::{resolve_config, CommonArgs};

#[derive(Parser)]
#[command(name = "stakeidxd")]
#[command(about = "Staking indexer daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every selected network until interrupted
    Run(CommonArgs),
    /// Rebuild all aggregates from the transaction log and exit
    Reindex(CommonArgs),
    /// Load and validate the configuration, then exit
    CheckConfig(CommonArgs),
}

#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Index(#[from] ChainIndexError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

type Store = PersistentIndex;

/// Everything built for one network.
struct NetworkStack {
    service: Arc<StakingQueryService<Store>>,
    coordinator: Arc<SyncCoordinator<CometRpcClient, Store>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Reindex(args) => reindex(args).await,
        Commands::CheckConfig(args) => check_config(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "stakeidxd failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve the config, install logging and run the pre-flight checks.
fn prepare(args: &CommonArgs) -> Result<IndexerConfig, DaemonError> {
    let config = resolve_config(args)?;
    init_logging_from_config(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    let report = run_startup(&config)?;
    for warning in &report.warnings {
        tracing::warn!(warning = %warning, "Startup check warning");
    }
    Ok(config)
}

fn open_store(config: &IndexerConfig, network: &str) -> Result<Arc<Store>, DaemonError> {
    let path = config.storage.database_path(network);
    let store = PersistentIndex::new(&path, config.storage.read_pool_size)?;
    check_network_database(network, &path, || store.initialize())?;
    tracing::info!(network = %network, path = %path.display(), "Opened network database");
    Ok(Arc::new(store))
}

fn build_network(
    config: &IndexerConfig,
    network: &NetworkConfig,
    phases: &Arc<PhaseTable>,
    metrics: &MetricsRegistry,
    clock: &Arc<dyn Clock>,
) -> Result<NetworkStack, DaemonError> {
    let store = open_store(config, &network.name)?;
    let accountant = Arc::new(PhaseCapAccountant::new(Arc::clone(&store), Arc::clone(phases)));
    let reindexer = Arc::new(AggregateReindexer::new(Arc::clone(&store)));

    let observer: Option<Arc<dyn CacheObserver>> = if config.observability.metrics_enabled {
        Some(metrics.indexer.clone() as Arc<dyn CacheObserver>)
    } else {
        None
    };
    let service = Arc::new(StakingQueryService::new(
        Arc::clone(&store),
        Arc::clone(phases),
        Arc::clone(&reindexer),
        config.cache.to_cache_config(),
        Arc::clone(clock),
        observer,
    ));

    let decoder = Arc::new(EventDecoder::new(config.decoder.clone()));
    let ingestor = Ingestor::new(&network.name, store, accountant, reindexer, decoder)
        .with_invalidation(Arc::clone(&service) as Arc<dyn CacheInvalidation>)
        .with_metrics(metrics.indexer.clone())
        .with_aggregate_retry(RetryPolicy::from_config(&config.sync));

    let client = Arc::new(CometRpcClient::from_config(network)?);
    let coordinator = Arc::new(SyncCoordinator::new(
        client,
        Arc::new(ingestor),
        SyncSettings::from_config(&config.sync),
        Arc::clone(clock),
    ));

    Ok(NetworkStack {
        service,
        coordinator,
    })
}

async fn run(args: CommonArgs) -> Result<(), DaemonError> {
    let config = prepare(&args)?;

    let phases = Arc::new(PhaseTable::new(config.phase_definitions())?);
    let metrics = MetricsRegistry::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = Arc::new(NetworkRegistry::new());
    let sweepers = Arc::new(TaskGroup::new("cache-sweepers"));
    let sweep_interval = Duration::from_secs(config.cache.sweep_interval_secs.max(1));
    let mut services = Vec::new();

    for network in config.enabled_networks() {
        let stack = build_network(&config, network, &phases, &metrics, &clock)?;
        sweepers
            .track(stack.service.spawn_sweepers(sweep_interval, sweepers.stop_signal()))
            .await;
        registry.register(stack.coordinator)?;
        services.push((network.name.clone(), stack.service));
    }

    let shutdown = ShutdownCoordinator::new(Duration::from_secs(
        config.operations.shutdown_timeout_secs,
    ));
    // Sync stops first, then the caches it invalidates.
    shutdown.register(sweepers).await;
    shutdown.register(registry.clone()).await;

    registry.start_all()?;
    tracing::info!(
        networks = ?registry.networks(),
        phases = phases.phases().len(),
        "Indexer started"
    );

    let signals = SignalHandler::new();
    signals.start();
    let reason = signals.wait().await;

    for status in registry.statuses() {
        tracing::info!(
            network = %status.network,
            height = ?status.backfill_height,
            ingested = status.transactions_ingested,
            skipped_ranges = status.skipped_ranges,
            "Final sync status"
        );
    }
    for (network, service) in &services {
        let stats = service.cache_stats();
        tracing::debug!(network = %network, hits = stats.hits, misses = stats.misses, "Cache stats");
    }

    shutdown.shutdown(reason).await?;

    if config.observability.metrics_enabled {
        let path = std::path::Path::new(&config.storage.path).join("metrics.prom");
        if let Err(e) = std::fs::write(&path, metrics.encode_prometheus()) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics snapshot");
        }
    }

    tracing::info!("Indexer stopped");
    Ok(())
}

async fn reindex(args: CommonArgs) -> Result<(), DaemonError> {
    let config = prepare(&args)?;

    for network in config.enabled_networks() {
        let store = open_store(&config, &network.name)?;
        let reindexer = AggregateReindexer::new(store);
        let report = tokio::task::spawn_blocking(move || reindexer.rebuild_all())
            .await
            .map_err(|e| ChainIndexError::Storage(format!("rebuild task failed: {e}")))??;

        if report.failed.is_empty() {
            tracing::info!(
                network = %network.name,
                transactions = report.transactions,
                stakers = report.stakers,
                finality_providers = report.finality_providers,
                replayed = report.replayed,
                "Rebuilt aggregates"
            );
        } else {
            tracing::warn!(
                network = %network.name,
                transactions = report.transactions,
                failed = ?report.failed,
                "Rebuilt aggregates with failures"
            );
        }
    }
    Ok(())
}

fn check_config(args: CommonArgs) -> Result<(), DaemonError> {
    let config = resolve_config(&args)?;
    let phases = PhaseTable::new(config.phase_definitions())?;
    let networks: Vec<&str> = config.enabled_networks().map(|n| n.name.as_str()).collect();
    if networks.is_empty() {
        return Err(StartupError::NoEnabledNetworks.into());
    }
    println!(
        "config ok: {} network(s) enabled [{}], {} phase(s)",
        networks.len(),
        networks.join(", "),
        phases.phases().len()
    );
    Ok(())
}
