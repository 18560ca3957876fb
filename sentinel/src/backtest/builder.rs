//! Build phase: a disposable simulation store seeded with reference data and the
//! price history the chosen universe needs.

use crate::{
    backtest::summary::{BacktestEvent, BacktestPhase, BacktestProgress, BacktestStatus, BacktestConfig},
    error::SentinelError,
};
use rand::prelude::IndexedRandom;
use sentinel_broker::Broker;
use sentinel_instrument::Symbol;
use sentinel_store::{Store, security::Security, sim::SimulationStore, sqlite::SqliteStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Creates and populates the temporary simulation store.
pub struct BacktestBuilder {
    config: BacktestConfig,
    live_store: Arc<SqliteStore>,
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for BacktestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacktestBuilder").finish_non_exhaustive()
    }
}

impl BacktestBuilder {
    pub fn new(
        config: BacktestConfig,
        live_store: Arc<SqliteStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            config,
            live_store,
            broker,
        }
    }

    /// Build the simulation store at `path`, emitting progress events. Returns the
    /// ready store and the resolved universe, or `None` when no universe could be
    /// determined (an error event has been emitted).
    pub async fn build(
        &self,
        path: &std::path::Path,
        events: &mpsc::Sender<BacktestEvent>,
    ) -> Result<Option<(SimulationStore, Vec<Symbol>)>, SentinelError> {
        let _ = events
            .send(BacktestEvent::Progress(BacktestProgress::phase(
                BacktestStatus::Preparing,
                BacktestPhase::PrepareStore,
                "Preparing simulation store...",
            )))
            .await;

        let sim = SimulationStore::create(path).await?;
        sim.initialize_from(&self.live_store).await?;

        let _ = events
            .send(BacktestEvent::Progress(BacktestProgress::phase(
                BacktestStatus::Discovering,
                BacktestPhase::DiscoverSymbols,
                "Discovering securities...",
            )))
            .await;

        let symbols = self.discover_symbols().await?;
        if symbols.is_empty() {
            let _ = events
                .send(BacktestEvent::Progress(BacktestProgress::phase(
                    BacktestStatus::Error,
                    BacktestPhase::DiscoverSymbols,
                    "No securities found for backtest",
                )))
                .await;
            return Ok(None);
        }

        let total = symbols.len();
        for (index, symbol) in symbols.iter().enumerate() {
            let mut progress = BacktestProgress::phase(
                BacktestStatus::Downloading,
                BacktestPhase::DownloadPrices,
                "Downloading historical data...",
            );
            progress.progress_pct = index as f64 / total as f64 * 100.0;
            progress.current_item = Some(symbol.clone());
            progress.items_done = index;
            progress.items_total = total;
            let _ = events.send(BacktestEvent::Progress(progress)).await;

            self.populate_symbol(&sim, symbol).await?;
        }

        info!(symbols = total, "simulation store ready");
        Ok(Some((sim, symbols)))
    }

    /// Resolve the symbol universe per config: existing active set, a random
    /// sample of the broker's top list, or the explicit list.
    async fn discover_symbols(&self) -> Result<Vec<Symbol>, SentinelError> {
        if self.config.use_existing_universe {
            return Ok(self
                .live_store
                .securities(true)
                .await?
                .into_iter()
                .map(|security| security.symbol)
                .collect());
        }

        if self.config.pick_random {
            let available = self.broker.get_available_securities().await?;
            let mut rng = rand::rng();
            let count = self.config.random_count.min(available.len());
            return Ok(available
                .choose_multiple(&mut rng, count)
                .cloned()
                .collect());
        }

        Ok(self.config.symbols.clone())
    }

    /// Make sure the simulation store has security metadata and prices for one
    /// symbol: already seeded from the live store, or fetched from the broker
    /// (20 years of history).
    async fn populate_symbol(
        &self,
        sim: &SimulationStore,
        symbol: &Symbol,
    ) -> Result<(), SentinelError> {
        let has_prices = sim.has_prices(symbol).await?;
        if sim.security(symbol).await?.is_some() && has_prices {
            return Ok(());
        }

        match self.broker.get_security_info(symbol).await {
            Ok(Some(info)) => {
                let mut security = Security::new(symbol.clone(), info.name, info.currency);
                security.market_id = info.market_id;
                security.min_lot = info.min_lot;
                sim.upsert_security(&security).await?;
            }
            Ok(None) => {
                sim.upsert_security(&Security::new(
                    symbol.clone(),
                    symbol.to_string(),
                    sentinel_instrument::Ccy::EUR,
                ))
                .await?;
            }
            Err(error) => {
                warn!(%symbol, %error, "security info fetch failed, seeding minimal entry");
                sim.upsert_security(&Security::new(
                    symbol.clone(),
                    symbol.to_string(),
                    sentinel_instrument::Ccy::EUR,
                ))
                .await?;
            }
        }

        if !has_prices {
            let fetched = self
                .broker
                .get_historical_prices_bulk(std::slice::from_ref(symbol), 20)
                .await?;
            if let Some(bars) = fetched.get(symbol) {
                if !bars.is_empty() {
                    sim.save_prices(symbol, bars).await?;
                }
            }
        }

        Ok(())
    }
}
