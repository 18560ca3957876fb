//! One-off historical-price sync: twenty years for a single symbol, or for every
//! active security with a delay between requests to stay inside API limits.

use clap::Parser;
use sentinel::logging::init_logging;
use sentinel_broker::{Broker, Tradernet};
use sentinel_instrument::Symbol;
use sentinel_store::{Store, sqlite::SqliteStore};
use std::{path::PathBuf, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "sync-prices", about = "Sync historical prices (20 years)")]
struct Args {
    /// Path of the SQLite store.
    #[arg(long, default_value = "sentinel.db")]
    db: PathBuf,

    /// Sync only this symbol (e.g. AAPL.US).
    #[arg(long)]
    symbol: Option<String>,

    /// Seconds to wait between symbols when syncing all.
    #[arg(long, default_value_t = 10.0)]
    delay: f64,
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(error) = run(Args::parse()).await {
        warn!(%error, "price sync failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteStore::connect(&args.db).await?;
    info!(db = %args.db.display(), "store connected");

    let api_key = store.setting("tradernet_api_key").await?;
    let api_secret = store.setting("tradernet_api_secret").await?;
    let broker = Tradernet::new(api_key, api_secret);

    if let Some(symbol) = args.symbol {
        let symbol = Symbol::new(symbol.trim());
        info!(%symbol, "fetching 20 years of history");
        sync_one(&store, &broker, &symbol).await?;
    } else {
        // Clearing stale derived caches before a full sweep keeps downstream
        // analytics from mixing old and new series.
        let cleared = store.cache_clear().await?;
        info!(cleared, "cache cleared before full sync");

        let securities = store.securities(true).await?;
        let total = securities.len();
        info!(total, delay = args.delay, "syncing all active securities");

        let mut synced = 0_usize;
        for (index, security) in securities.iter().enumerate() {
            info!(
                symbol = %security.symbol,
                progress = format!("{}/{}", index + 1, total),
                "fetching 20 years of history"
            );
            if sync_one(&store, &broker, &security.symbol).await? {
                synced += 1;
            }
            if index + 1 < total {
                tokio::time::sleep(Duration::from_secs_f64(args.delay)).await;
            }
        }
        info!(synced, total, "historical price sync finished");
    }

    Ok(())
}

async fn sync_one(
    store: &SqliteStore,
    broker: &Tradernet,
    symbol: &Symbol,
) -> Result<bool, Box<dyn std::error::Error>> {
    let prices = broker
        .get_historical_prices_bulk(std::slice::from_ref(symbol), 20)
        .await?;

    match prices.get(symbol) {
        Some(bars) if !bars.is_empty() => {
            store.save_prices(symbol, bars).await?;
            info!(%symbol, rows = bars.len(), "saved");
            Ok(true)
        }
        _ => {
            warn!(%symbol, "no data returned");
            Ok(false)
        }
    }
}
