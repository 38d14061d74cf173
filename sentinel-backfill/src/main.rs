use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use sentinel_core::retry::concurrent_process;
use sentinel_core::rpc::TransactionResponse;
use sentinel_core::validation::{parse_address_list, BackfillConfig};
use sentinel_core::{normalize_transaction, Database, Metrics, RpcClient};
use std::collections::HashSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sentinel Backfill - Historical Solana transaction indexer
#[derive(Parser)]
#[command(name = "sentinel-backfill")]
#[command(about = "Backfill historical Solana transactions and events from RPC", long_about = None)]
struct Cli {
    /// Solana RPC URL
    #[arg(short, long, env = "SOLANA_HTTP_URL", default_value = "https://api.mainnet-beta.solana.com")]
    rpc_url: String,

    /// Comma-separated list of addresses (programs or accounts) to backfill
    #[arg(short, long, env = "SUBSCRIBE_PROGRAMS")]
    addresses: String,

    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./sentinel.db")]
    db_url: String,

    /// Number of signatures to fetch per address (latest N transactions)
    #[arg(short, long, default_value = "100")]
    limit: usize,

    /// Only fetch signatures older than this one
    #[arg(long)]
    before: Option<String>,

    /// Batch size for fetching transactions
    #[arg(short, long, default_value = "20")]
    batch_size: usize,

    /// Transactions fetched concurrently within a batch
    #[arg(short, long, default_value = "4")]
    concurrency: usize,

    /// Delay between batches (milliseconds)
    #[arg(long, default_value = "120")]
    batch_delay: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct StoredTransaction {
    events: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                cancel.cancel();
            }
        });
    }

    run_backfill(cli, cancel).await
}

async fn run_backfill(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let addresses = parse_address_list(&cli.addresses);
    BackfillConfig {
        rpc_url: cli.rpc_url.clone(),
        addresses: addresses.clone(),
        db_url: cli.db_url.clone(),
        limit: cli.limit,
        concurrency: cli.concurrency,
    }
    .validate()
    .context("Invalid configuration")?;

    info!("Starting Sentinel Backfill");
    info!("RPC URL: {}", cli.rpc_url);
    info!("Fetching latest {} signatures per address", cli.limit);
    info!("Batch size: {}, concurrency: {}", cli.batch_size, cli.concurrency);

    let db = Database::new(&cli.db_url).await?;
    info!("Database connected: {}", cli.db_url);

    let metrics = Metrics::shared();
    let rpc = RpcClient::new(cli.rpc_url.clone())?.with_metrics(metrics.clone());

    let mut processed_signatures: HashSet<String> = HashSet::new();
    let mut total_signatures_fetched = 0;
    let mut total_events_stored = 0;

    for address in &addresses {
        if cancel.is_cancelled() {
            break;
        }
        info!("Processing address: {}", address);

        let signatures = match rpc
            .get_signatures_for_address(address, cli.limit, cli.before.as_deref(), &cancel)
            .await
        {
            Ok(signatures) => signatures,
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                error!("Failed to get signatures for {}: {}", address, e);
                continue;
            }
        };
        info!("Found {} signatures", signatures.len());
        total_signatures_fetched += signatures.len();

        let pending: Vec<String> = signatures
            .into_iter()
            .map(|info| info.signature)
            .filter(|signature| processed_signatures.insert(signature.clone()))
            .collect();

        let mut address_events = 0;
        for (batch_index, batch) in pending.chunks(cli.batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if batch_index > 0 {
                tokio::time::sleep(Duration::from_millis(cli.batch_delay)).await;
            }

            let results = concurrent_process(batch.to_vec(), cli.concurrency, |signature| {
                let (rpc, db, cancel) = (&rpc, &db, &cancel);
                async move { backfill_signature(rpc, db, &signature, cancel).await }
            })
            .await;

            for (signature, stored) in batch.iter().zip(results) {
                match stored {
                    Ok(Some(stored)) => address_events += stored.events,
                    Ok(None) => debug!("Transaction {} not found", signature),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("Failed to backfill {}: {}", signature, e),
                }
            }
        }

        total_events_stored += address_events;
        info!("Address {} complete: {} events stored", address, address_events);
    }

    info!("Backfill complete!");
    info!("Total signatures fetched: {}", total_signatures_fetched);
    info!("Unique signatures processed: {}", processed_signatures.len());
    info!("Total events stored: {}", total_events_stored);

    for tx in db.list_recent_transactions(5).await? {
        debug!("  {} slot {} fee {}", tx.signature, tx.slot, tx.fee);
    }
    metrics.log_summary();

    Ok(())
}

async fn backfill_signature(
    rpc: &RpcClient,
    db: &Database,
    signature: &str,
    cancel: &CancellationToken,
) -> sentinel_core::Result<Option<StoredTransaction>> {
    match rpc.get_transaction(signature, cancel).await? {
        Some(tx) => store_transaction(db, signature, &tx).await.map(Some),
        None => Ok(None),
    }
}

async fn store_transaction(
    db: &Database,
    signature: &str,
    tx: &TransactionResponse,
) -> sentinel_core::Result<StoredTransaction> {
    let (row, events) = normalize_transaction(signature, tx, Utc::now());
    db.upsert_transaction(&row).await?;
    let events = db.replace_events_for_signature(signature, &events).await?;
    Ok(StoredTransaction { events })
}
