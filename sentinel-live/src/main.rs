use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sentinel_core::validation::{
    parse_address_list, validate_commitment, validate_db_url, validate_redis_url, LiveConfig,
};
use sentinel_core::{
    Database, DedupeConfig, DedupeGuard, EventFilter, EventKind, EventLogConfig, Fanout,
    FanoutConfig, HealthCheck, HealthStatus, IdentityShape, IngestConfig, Ingestor, LiveHub,
    LogEventQuery, LogsFilter, Materializer, MaterializerConfig, Metrics, RedisDedupeStore,
    RedisEventLog, RpcClient, SourceWatcher, StartPosition, TracingSink, WatcherConfig,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Sentinel Live - Solana log ingestion, materialization and live delivery
#[derive(Parser)]
#[command(name = "sentinel-live")]
#[command(about = "Ingest Solana log notifications into Redis and materialize them into SQL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize database schema
    Init {
        #[command(flatten)]
        db: DbArgs,
    },
    /// Watch the node and append accepted notifications to the event log
    Ingest {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        redis: RedisArgs,
        /// Log every live event as it arrives
        #[arg(long)]
        tail: bool,
        /// Only tail events of this kind (transfer, token_transfer, program_log)
        #[arg(long)]
        tail_kind: Option<EventKind>,
    },
    /// Project the event log into the tx_events table
    Materialize {
        #[command(flatten)]
        redis: RedisArgs,
        #[command(flatten)]
        db: DbArgs,
        /// Start position: 0-0 (replay retained entries), $ (new only) or a log ID
        #[arg(long, env = "REDIS_FROM", default_value = "0-0")]
        from: String,
    },
    /// Ingest and materialize in one process
    Run {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        redis: RedisArgs,
        #[command(flatten)]
        db: DbArgs,
        #[arg(long, env = "REDIS_FROM", default_value = "0-0")]
        from: String,
        #[arg(long)]
        tail: bool,
    },
    /// Print the newest materialized rows
    Query {
        #[command(flatten)]
        db: DbArgs,
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Case-insensitive substring matched against the logs
        #[arg(short, long)]
        program: Option<String>,
        #[arg(long)]
        since_slot: Option<u64>,
        #[arg(long)]
        until_slot: Option<u64>,
    },
}

#[derive(Args, Clone)]
struct SourceArgs {
    /// Solana RPC WebSocket URL
    #[arg(short, long, env = "SOLANA_WS_URL", default_value = "wss://api.mainnet-beta.solana.com")]
    ws_url: String,

    /// Solana RPC HTTP URL, used to check subscribed programs at startup
    #[arg(short, long, env = "SOLANA_HTTP_URL")]
    rpc_url: Option<String>,

    /// Log commitment level (processed, confirmed, finalized)
    #[arg(short, long, env = "SOLANA_COMMITMENT", default_value = "confirmed")]
    commitment: String,

    /// Comma-separated program IDs to subscribe to
    #[arg(long, env = "SUBSCRIBE_PROGRAMS", default_value = "")]
    programs: String,

    /// Comma-separated accounts to subscribe to
    #[arg(long, env = "SUBSCRIBE_ACCOUNTS", default_value = "")]
    accounts: String,

    /// Deduplicate on signature and slot instead of signature alone
    #[arg(long)]
    dedupe_by_slot: bool,
}

#[derive(Args, Clone)]
struct RedisArgs {
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    redis_url: String,

    /// Dedupe marker lifetime in seconds
    #[arg(long, env = "REDIS_DEDUPE_TTL_SEC", default_value = "86400")]
    dedupe_ttl_sec: u64,
}

#[derive(Args, Clone)]
struct DbArgs {
    /// Database URL (sqlite: or postgres://)
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./sentinel.db")]
    db_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match cli.command {
        Commands::Init { db } => init_db(&db).await?,
        Commands::Ingest {
            source,
            redis,
            tail,
            tail_kind,
        } => {
            validate(&source, &redis, None)?;
            let metrics = Metrics::shared();
            let summary = spawn_summary(metrics.clone(), cancel.clone());
            let hub = tail.then(|| LiveHub::new(FanoutConfig::default().hub_capacity));
            let mut tasks = vec![spawn_ingest(&source, &redis, hub.clone(), metrics.clone(), cancel.clone()).await?];
            if let Some(hub) = hub {
                tasks.push(spawn_tail(hub, tail_kind, &redis, metrics.clone(), cancel.clone()).await?);
            }
            join_all(tasks).await;
            summary.await.ok();
            metrics.log_summary();
        }
        Commands::Materialize { redis, db, from } => {
            validate_redis_url(&redis.redis_url).context("Invalid configuration")?;
            validate_db_url(&db.db_url).context("Invalid configuration")?;
            let metrics = Metrics::shared();
            let summary = spawn_summary(metrics.clone(), cancel.clone());
            spawn_materializer(&redis, &db, &from, metrics.clone(), cancel.clone())
                .await?
                .await
                .ok();
            summary.await.ok();
            metrics.log_summary();
        }
        Commands::Run {
            source,
            redis,
            db,
            from,
            tail,
        } => {
            validate(&source, &redis, Some(&db))?;
            let metrics = Metrics::shared();
            let summary = spawn_summary(metrics.clone(), cancel.clone());
            let hub = tail.then(|| LiveHub::new(FanoutConfig::default().hub_capacity));

            let mut tasks = vec![
                spawn_materializer(&redis, &db, &from, metrics.clone(), cancel.clone()).await?,
                spawn_ingest(&source, &redis, hub.clone(), metrics.clone(), cancel.clone()).await?,
            ];
            if let Some(hub) = hub {
                tasks.push(spawn_tail(hub, None, &redis, metrics.clone(), cancel.clone()).await?);
            }
            join_all(tasks).await;
            summary.await.ok();
            metrics.log_summary();
        }
        Commands::Query {
            db,
            limit,
            program,
            since_slot,
            until_slot,
        } => {
            let database = Database::new(&db.db_url).await?;
            let rows = database
                .latest_log_events(&LogEventQuery {
                    limit: Some(limit),
                    program_contains: program,
                    since_slot,
                    until_slot,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

fn validate(source: &SourceArgs, redis: &RedisArgs, db: Option<&DbArgs>) -> Result<()> {
    LiveConfig {
        ws_url: source.ws_url.clone(),
        rpc_url: source.rpc_url.clone(),
        redis_url: redis.redis_url.clone(),
        db_url: db.map(|d| d.db_url.clone()),
        commitment: source.commitment.clone(),
        programs: parse_address_list(&source.programs),
        accounts: parse_address_list(&source.accounts),
    }
    .validate()
    .context("Invalid configuration")
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            cancel.cancel();
        }
    });
}

fn spawn_summary(metrics: Arc<Metrics>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let health = HealthCheck::new(metrics.clone());
        let mut ticker = interval(SUMMARY_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    metrics.log_summary();
                    match health.check() {
                        HealthStatus::Healthy => {}
                        status => warn!("Pipeline health: {}", status),
                    }
                }
            }
        }
    })
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!("Task panicked: {}", e);
        }
    }
}

async fn init_db(db: &DbArgs) -> Result<()> {
    info!("Initializing database...");

    let database = Database::new(&db.db_url).await?;
    database.health().await?;
    info!("Database initialized successfully at: {}", db.db_url);

    Ok(())
}

async fn check_programs(rpc_url: &str, programs: &[String], metrics: Arc<Metrics>, cancel: &CancellationToken) {
    let rpc = match RpcClient::new(rpc_url) {
        Ok(rpc) => rpc.with_metrics(metrics),
        Err(e) => {
            warn!("Cannot build RPC client for {}: {}", rpc_url, e);
            return;
        }
    };

    for program in programs {
        match rpc.get_account_info(program, cancel).await {
            Ok(response) => match response.value {
                Some(account) if !account.executable => {
                    warn!("{} is not an executable program (owner {})", program, account.owner)
                }
                Some(_) => {}
                None => warn!("Program {} not found at slot {}", program, response.context.slot),
            },
            Err(e) => error!("Failed to fetch account {}: {}", program, e),
        }
    }
}

async fn spawn_ingest(
    source: &SourceArgs,
    redis: &RedisArgs,
    hub: Option<LiveHub>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let commitment = validate_commitment(&source.commitment)?;
    let programs = parse_address_list(&source.programs);
    let accounts = parse_address_list(&source.accounts);

    if let Some(rpc_url) = &source.rpc_url {
        check_programs(rpc_url, &programs, metrics.clone(), &cancel).await;
    }

    let mentions: Vec<String> = programs.iter().chain(accounts.iter()).cloned().collect();
    info!("WebSocket URL: {}", source.ws_url);
    info!("Commitment: {}", commitment);
    info!("Subscribed addresses: {}", if mentions.is_empty() { "all".to_string() } else { mentions.join(", ") });

    let log = RedisEventLog::connect(&redis.redis_url, EventLogConfig::default())
        .await
        .context("Failed to open the event log")?;
    let store = RedisDedupeStore::connect(&redis.redis_url)
        .await
        .context("Failed to open the dedupe store")?;
    let guard = DedupeGuard::new(Arc::new(store), DedupeConfig::default(), metrics.clone());

    let config = IngestConfig {
        dedupe_ttl: Duration::from_secs(redis.dedupe_ttl_sec.max(1)),
        identity: if source.dedupe_by_slot {
            IdentityShape::SignatureSlot
        } else {
            IdentityShape::Signature
        },
        ..IngestConfig::default()
    };
    let mut ingestor = Ingestor::new(Arc::new(log), guard, config, metrics.clone());
    if let Some(hub) = hub {
        ingestor = ingestor.with_hub(hub);
    }

    let watcher_config = WatcherConfig {
        filter: LogsFilter::from_addresses(mentions),
        commitment,
        ..WatcherConfig::new(source.ws_url.clone())
    };
    let watcher = SourceWatcher::new(watcher_config, metrics).spawn(cancel.clone());

    Ok(tokio::spawn(async move {
        ingestor.run(watcher.notifications, cancel).await;
        if let Err(e) = watcher.task.await {
            error!("Watcher task failed: {}", e);
        }
    }))
}

async fn spawn_materializer(
    redis: &RedisArgs,
    db: &DbArgs,
    from: &str,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let database = Database::new(&db.db_url)
        .await
        .context("Failed to open the database")?;
    info!("Database connected: {}", db.db_url);

    // Blocking reads get a connection of their own.
    let log = RedisEventLog::connect(&redis.redis_url, EventLogConfig::default())
        .await
        .context("Failed to open the event log")?;

    let config = MaterializerConfig {
        start: StartPosition::parse(from),
        ..MaterializerConfig::default()
    };
    let materializer = Materializer::new(Arc::new(log), database, config, metrics);

    Ok(tokio::spawn(async move {
        if let Err(e) = materializer.run(cancel).await {
            error!("Materializer failed: {}", e);
        }
    }))
}

async fn spawn_tail(
    hub: LiveHub,
    kind: Option<EventKind>,
    redis: &RedisArgs,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let store = RedisDedupeStore::connect(&redis.redis_url)
        .await
        .context("Failed to open the dedupe store")?;
    let guard = DedupeGuard::new(Arc::new(store), DedupeConfig::default(), metrics.clone());
    let fanout = Fanout::new(hub, guard, FanoutConfig::default(), metrics);

    let mut filter = EventFilter::default();
    if let Some(kind) = kind {
        filter = filter.with_kind(kind);
    }

    Ok(tokio::spawn(async move {
        let mut sink = TracingSink::new("tail");
        if let Err(e) = fanout.serve(filter, &mut sink, cancel).await {
            error!("Live tail stopped: {}", e);
        }
    }))
}
