//! Long-running Sentinel service: job runtime plus the informational HTTP surface.

use clap::Parser;
use sentinel::{
    AppContext,
    config::Settings,
    jobs::{JobRuntime, schedule::seed_schedules},
    logging::{init_json_logging, init_logging},
    server::{ServerState, router},
};
use sentinel_broker::{Broker, Tradernet, TradingMode};
use sentinel_store::{Store, sqlite::SqliteStore};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "sentineld", about = "Sentinel portfolio automation service")]
struct Args {
    /// Path of the SQLite store.
    #[arg(long, default_value = "sentinel.db")]
    db: PathBuf,

    /// Listen address for the HTTP surface.
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: String,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.json_logs {
        init_json_logging();
    } else {
        init_logging();
    }

    if let Err(error) = run(args).await {
        error!(%error, "sentineld failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(SqliteStore::connect(&args.db).await?);

    let settings = Settings::new(Arc::clone(&store) as Arc<dyn Store>);
    settings.init_defaults().await?;
    for seed in seed_schedules() {
        store.upsert_job_schedule(&seed).await?;
    }

    let api_key = store.setting("tradernet_api_key").await?;
    let api_secret = store.setting("tradernet_api_secret").await?;
    let broker = Arc::new(Tradernet::new(api_key, api_secret));
    let mode = TradingMode::parse(&settings.get_str("trading_mode", "research").await);
    broker.set_mode(mode);
    info!(connected = broker.connected(), ?mode, "broker initialised");

    let ctx = AppContext::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&broker) as Arc<dyn Broker>,
        Some(args.db.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime = JobRuntime::new(ctx.clone());
    let runtime_task = tokio::spawn(runtime.run(shutdown_rx));

    let (events, _) = broadcast::channel(256);
    let state = ServerState {
        ctx,
        live_store: store,
        events,
    };

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "http surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    runtime_task.await?;
    Ok(())
}
