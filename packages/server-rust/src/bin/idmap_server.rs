//! ID mapping server binary.
//!
//! Startup order: parse flags, init logging and metrics, open the store and
//! create missing tables, replay the binlog, start the scheduler, serve.
//! On Ctrl-C the HTTP server drains, the scheduler stops, and a final
//! binlog flush runs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use idmap_core::{ClockSource, SystemClock};
use idmap_server::binlog::Binlog;
use idmap_server::cluster::{HttpPeerClient, PeerInstance, PeerResolver, StaticRegistry};
use idmap_server::engine::Engine;
use idmap_server::network::{NetworkConfig, NetworkModule};
use idmap_server::service::{
    spawn_all, IdMappingService, JobSchedule, MappingConfig, ScheduleConfig, Scheduler,
};
use idmap_server::storage::{ensure_tables, MappingStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "idmap-server", about = "Bidirectional ID mapping cache")]
struct Args {
    #[arg(long, env = "IDMAP_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "IDMAP_PORT", default_value_t = 8080)]
    port: u16,

    /// Logical service name used for peer discovery.
    #[arg(long, env = "IDMAP_SERVICE_NAME", default_value = "idmap")]
    service_name: String,

    /// Comma-separated `host:port` list of sibling instances.
    #[arg(long, env = "IDMAP_PEERS", default_value = "")]
    peers: String,

    /// This instance as peers see it; never queried.
    #[arg(long, env = "IDMAP_SELF_ADDR")]
    self_addr: Option<PeerInstance>,

    #[arg(long, env = "IDMAP_PEER_TIMEOUT_MS", default_value_t = 500)]
    peer_timeout_ms: u64,

    /// `PostgreSQL` connection string; without it rows live in memory.
    #[cfg(feature = "postgres")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[cfg(feature = "postgres")]
    #[arg(long, env = "IDMAP_DB_MAX_CONNECTIONS", default_value_t = 32)]
    db_max_connections: u32,

    /// Address for the Prometheus scrape endpoint.
    #[arg(long, env = "IDMAP_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[arg(long, env = "IDMAP_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,

    #[arg(long, env = "IDMAP_HASH_MOD", default_value_t = 64)]
    hash_mod: u32,

    #[arg(long, env = "IDMAP_ENTER_DB_THREADS", default_value_t = 16)]
    enter_db_thread_size: usize,

    #[arg(long, env = "IDMAP_POOL_QUEUE_CAPACITY", default_value_t = 4096)]
    pool_queue_capacity: usize,

    #[arg(long, env = "IDMAP_LIMIT_COUNT", default_value_t = 20_000)]
    limit_count: usize,

    #[arg(long, env = "IDMAP_DELETE_COUNT", default_value_t = 5_000)]
    delete_count: u32,

    #[arg(long, env = "IDMAP_BATCH_COUNT", default_value_t = 2_000)]
    batch_count: usize,

    #[arg(long, env = "IDMAP_MEM_CACHE_SECS", default_value_t = 600)]
    mem_cache_secs: u64,

    #[arg(long, env = "IDMAP_DB_CACHE_SECS", default_value_t = 86_400)]
    db_cache_secs: u64,

    #[arg(long, env = "IDMAP_TABLE_PREFIX", default_value = "id_mapping_")]
    table_prefix: String,

    /// Binlog directory; defaults to the executable's directory.
    #[arg(
        long,
        env = "IDMAP_BINLOG_DIR",
        default_value = "",
        value_parser = clap::builder::TypedValueParser::map(clap::builder::OsStringValueParser::new(), PathBuf::from)
    )]
    binlog_dir: PathBuf,

    #[arg(long, env = "IDMAP_BINLOG_CHUNK_SIZE", default_value_t = 1_000)]
    binlog_chunk_size: usize,

    #[arg(long, env = "IDMAP_PEER_MAX_VALUE_LEN", default_value_t = 40)]
    peer_max_value_len: usize,

    #[arg(long, env = "IDMAP_DISPATCH_WAIT_SECS", default_value_t = 600)]
    dispatch_wait_secs: u64,

    #[arg(long, env = "IDMAP_LOCK_WAIT_SECS", default_value_t = 60)]
    lock_wait_secs: u64,

    /// Put rows of failed insert chunks back into the pending buffers.
    #[arg(long, env = "IDMAP_RETRY_FAILED_CHUNKS")]
    retry_failed_chunks: bool,

    /// Delay before any background job first runs.
    #[arg(long, env = "IDMAP_JOB_INITIAL_DELAY_SECS", default_value_t = 60)]
    job_initial_delay_secs: u64,

    #[arg(long, env = "IDMAP_PROMOTION_PERIOD_SECS", default_value_t = 10)]
    promotion_period_secs: u64,

    #[arg(long, env = "IDMAP_PERSISTENCE_PERIOD_SECS", default_value_t = 60)]
    persistence_period_secs: u64,

    #[arg(long, env = "IDMAP_BINLOG_PERIOD_SECS", default_value_t = 60)]
    binlog_period_secs: u64,

    #[arg(long, env = "IDMAP_PEER_REFRESH_PERIOD_SECS", default_value_t = 60)]
    peer_refresh_period_secs: u64,
}

impl Args {
    fn mapping_config(&self) -> MappingConfig {
        MappingConfig {
            hash_mod: self.hash_mod,
            enter_db_thread_size: self.enter_db_thread_size,
            pool_queue_capacity: self.pool_queue_capacity,
            limit_count: self.limit_count,
            delete_count: self.delete_count,
            batch_count: self.batch_count,
            mem_cache_time: Duration::from_secs(self.mem_cache_secs),
            db_cache_time: Duration::from_secs(self.db_cache_secs),
            table_prefix: self.table_prefix.clone(),
            binlog_dir: self.binlog_dir.clone(),
            binlog_chunk_size: self.binlog_chunk_size,
            peer_max_value_len: self.peer_max_value_len,
            dispatch_wait: Duration::from_secs(self.dispatch_wait_secs),
            lock_wait: Duration::from_secs(self.lock_wait_secs),
            retry_failed_chunks: self.retry_failed_chunks,
        }
    }

    fn schedule_config(&self) -> ScheduleConfig {
        let delay = Duration::from_secs(self.job_initial_delay_secs);
        let every = |secs| JobSchedule::new(delay, Duration::from_secs(secs));
        ScheduleConfig {
            promotion: every(self.promotion_period_secs),
            persistence: every(self.persistence_period_secs),
            binlog: every(self.binlog_period_secs),
            peer_refresh: every(self.peer_refresh_period_secs),
        }
    }

    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            ..NetworkConfig::default()
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[cfg(feature = "postgres")]
async fn open_store(args: &Args, config: &MappingConfig) -> anyhow::Result<Arc<dyn MappingStore>> {
    use idmap_server::storage::datastores::{MemoryMappingStore, PostgresMappingStore};

    match &args.database_url {
        Some(url) => {
            let store =
                PostgresMappingStore::connect(url, args.db_max_connections, &config.table_prefix)
                    .await
                    .context("connecting to PostgreSQL")?;
            info!("using PostgreSQL mapping store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database URL, rows are kept in memory only");
            Ok(Arc::new(MemoryMappingStore::with_prefix(&config.table_prefix)))
        }
    }
}

#[cfg(not(feature = "postgres"))]
#[allow(clippy::unused_async)]
async fn open_store(_args: &Args, config: &MappingConfig) -> anyhow::Result<Arc<dyn MappingStore>> {
    use idmap_server::storage::datastores::MemoryMappingStore;

    warn!("built without the postgres feature, rows are kept in memory only");
    Ok(Arc::new(MemoryMappingStore::with_prefix(&config.table_prefix)))
}

async fn build_peers(args: &Args, config: &MappingConfig) -> anyhow::Result<Option<Arc<PeerResolver>>> {
    let registry = StaticRegistry::parse(&args.peers).context("parsing --peers")?;
    if args.peers.trim().is_empty() {
        return Ok(None);
    }
    let client = HttpPeerClient::new(Duration::from_millis(args.peer_timeout_ms))
        .context("building peer HTTP client")?;
    let resolver = PeerResolver::new(
        args.service_name.clone(),
        Arc::new(registry),
        Arc::new(client),
        args.self_addr.clone(),
        config.peer_max_value_len,
    );
    if let Err(err) = resolver.refresh().await {
        warn!(error = %err, "initial peer refresh failed");
    }
    Ok(Some(Arc::new(resolver)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let config = args.mapping_config();
    config.validate().context("invalid configuration")?;

    let store = open_store(&args, &config).await?;
    let created = ensure_tables(store.as_ref(), config.hash_mod)
        .await
        .context("creating shard tables")?;
    info!(created, hash_mod = config.hash_mod, "shard tables ready");

    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let engine = Arc::new(Engine::new(config.clone(), store, clock));

    let binlog = Arc::new(Binlog::new(
        Binlog::resolve_dir(&config.binlog_dir),
        config.binlog_chunk_size,
    ));
    let replay = {
        let engine = Arc::clone(&engine);
        let binlog = Arc::clone(&binlog);
        tokio::task::spawn_blocking(move || binlog.replay(&engine)).await?
    };
    match replay {
        Ok(report) => info!(
            files = report.files,
            applied = report.applied,
            skipped = report.skipped_by_cursor,
            malformed = report.malformed,
            "binlog replayed"
        ),
        Err(err) => warn!(error = %err, "binlog replay failed"),
    }

    let peers = build_peers(&args, &config).await?;

    let mut scheduler = Scheduler::new(config.lock_wait);
    let jobs = spawn_all(
        &mut scheduler,
        &args.schedule_config(),
        &engine,
        &binlog,
        peers.as_ref(),
    );

    let service = IdMappingService::new(Arc::clone(&engine), peers);
    let mut network = NetworkModule::new(args.network_config(), service);
    let port = network.start().await?;
    info!(port, binlog_dir = %binlog.dir().display(), "idmap server started");

    network
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for Ctrl-C");
            }
        })
        .await?;

    scheduler.shutdown().await;
    jobs.binlog.run_once().await;
    info!("idmap server stopped");
    Ok(())
}
