use crate::{
    CacheStats, SqliteStore, Store,
    cash::{CashFlowKind, CashFlowRecord, DividendRow},
    error::StoreError,
    job::{JobHistoryRecord, JobRunState, JobSchedule, JobScheduleUpdate},
    position::{Position, PositionUpdate},
    score::ScoreRow,
    security::Security,
    snapshot::SnapshotRow,
    target::AllocationTarget,
    trade::TradeRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use sentinel_instrument::{Ccy, Symbol, market::PriceBar};
use sqlx::Row;
use std::{collections::HashMap, path::Path};
use tracing::debug;

/// Isolated store used by the backtester.
///
/// Wraps a throwaway [`SqliteStore`] created at a temp path and seeded with reference
/// tables only. Two simulation behaviours on top of plain delegation:
/// * a mutable simulation date injected into all price reads, so no bar after the
///   simulated "today" can leak into a decision;
/// * nestable deferred writes batching statements into one outer transaction.
///
/// No write through this handle can ever reach the production store.
#[derive(Debug)]
pub struct SimulationStore {
    inner: SqliteStore,
    simulation_date: RwLock<Option<NaiveDate>>,
    txn_depth: Mutex<u32>,
}

impl SimulationStore {
    /// Create an empty simulation store at `path` (single connection, so deferred
    /// transactions span every statement).
    pub async fn create(path: &Path) -> Result<Self, StoreError> {
        let inner = SqliteStore::connect_with(path, 1).await?;
        Ok(Self {
            inner,
            simulation_date: RwLock::new(None),
            txn_depth: Mutex::new(0),
        })
    }

    /// Seed reference tables from the source store. The source is only ever read.
    pub async fn initialize_from(&self, source: &SqliteStore) -> Result<(), StoreError> {
        for (key, value) in source.all_settings().await? {
            self.inner.set_setting(&key, &value).await?;
        }

        for target in source.allocation_targets().await? {
            self.inner.upsert_allocation_target(&target).await?;
        }

        let securities = source.securities(false).await?;
        for security in &securities {
            self.inner.upsert_security(security).await?;
            let bars = source.prices(&security.symbol, None, None).await?;
            if !bars.is_empty() {
                self.inner.save_prices(&security.symbol, &bars).await?;
            }
        }

        debug!(securities = securities.len(), "simulation store seeded");
        Ok(())
    }

    /// Set the simulation clock that gates all price reads.
    pub fn set_simulation_date(&self, date: NaiveDate) {
        *self.simulation_date.write() = Some(date);
    }

    pub fn simulation_date(&self) -> Option<NaiveDate> {
        *self.simulation_date.read()
    }

    /// Enter a deferred-writes scope. Scopes nest; only the outermost opens the
    /// transaction. Every `begin_deferred` must be paired with `commit_deferred`.
    pub async fn begin_deferred(&self) -> Result<(), StoreError> {
        let is_outer = {
            let mut depth = self.txn_depth.lock();
            *depth += 1;
            *depth == 1
        };
        if is_outer {
            self.inner.execute_raw("BEGIN IMMEDIATE").await?;
        }
        Ok(())
    }

    /// Leave a deferred-writes scope, committing when the outermost scope closes.
    pub async fn commit_deferred(&self) -> Result<(), StoreError> {
        let is_outer = {
            let mut depth = self.txn_depth.lock();
            *depth = depth.saturating_sub(1);
            *depth == 0
        };
        if is_outer {
            self.inner.execute_raw("COMMIT").await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Full un-gated series for one symbol, newest-first. Used when seeding
    /// validators whose correction context must not depend on the simulation
    /// date (only the lookup is date-gated).
    pub async fn raw_prices(&self, symbol: &Symbol) -> Result<Vec<PriceBar>, StoreError> {
        self.inner.prices(symbol, None, None).await
    }

    /// Whether any bars exist for the symbol, ignoring the simulation date.
    pub async fn has_prices(&self, symbol: &Symbol) -> Result<bool, StoreError> {
        Ok(!self.inner.prices(symbol, Some(1), None).await?.is_empty())
    }

    fn effective_end(&self, end_date: Option<NaiveDate>) -> Option<NaiveDate> {
        end_date.or(*self.simulation_date.read())
    }
}

impl SqliteStore {
    /// Full settings listing, used when seeding a simulation store.
    pub async fn all_settings(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }
}

#[async_trait]
impl Store for SimulationStore {
    async fn security(&self, symbol: &Symbol) -> Result<Option<Security>, StoreError> {
        self.inner.security(symbol).await
    }

    async fn securities(&self, active_only: bool) -> Result<Vec<Security>, StoreError> {
        self.inner.securities(active_only).await
    }

    async fn upsert_security(&self, security: &Security) -> Result<(), StoreError> {
        self.inner.upsert_security(security).await
    }

    async fn position(&self, symbol: &Symbol) -> Result<Option<Position>, StoreError> {
        self.inner.position(symbol).await
    }

    async fn positions(&self) -> Result<Vec<Position>, StoreError> {
        self.inner.positions().await
    }

    async fn upsert_position(&self, update: &PositionUpdate) -> Result<(), StoreError> {
        self.inner.upsert_position(update).await
    }

    async fn prices(
        &self,
        symbol: &Symbol,
        days: Option<u32>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<PriceBar>, StoreError> {
        self.inner
            .prices(symbol, days, self.effective_end(end_date))
            .await
    }

    async fn prices_bulk(
        &self,
        symbols: &[Symbol],
        days: Option<u32>,
        end_date: Option<NaiveDate>,
    ) -> Result<HashMap<Symbol, Vec<PriceBar>>, StoreError> {
        self.inner
            .prices_bulk(symbols, days, self.effective_end(end_date))
            .await
    }

    async fn save_prices(&self, symbol: &Symbol, bars: &[PriceBar]) -> Result<(), StoreError> {
        self.inner.save_prices(symbol, bars).await
    }

    async fn record_trade(&self, trade: &TradeRecord) -> Result<bool, StoreError> {
        self.inner.record_trade(trade).await
    }

    async fn trades(
        &self,
        symbol: Option<&Symbol>,
        limit: Option<u32>,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        self.inner.trades(symbol, limit).await
    }

    async fn trades_chronological(&self) -> Result<Vec<TradeRecord>, StoreError> {
        self.inner.trades_chronological().await
    }

    async fn trades_count(&self) -> Result<u64, StoreError> {
        self.inner.trades_count().await
    }

    async fn cash_balances(&self) -> Result<HashMap<Ccy, f64>, StoreError> {
        self.inner.cash_balances().await
    }

    async fn set_cash_balance(&self, currency: &Ccy, amount: f64) -> Result<(), StoreError> {
        self.inner.set_cash_balance(currency, amount).await
    }

    async fn replace_cash_balances(
        &self,
        balances: &HashMap<Ccy, f64>,
    ) -> Result<(), StoreError> {
        self.inner.replace_cash_balances(balances).await
    }

    async fn record_cash_flow(&self, flow: &CashFlowRecord) -> Result<bool, StoreError> {
        self.inner.record_cash_flow(flow).await
    }

    async fn cash_flows(
        &self,
        kind: Option<CashFlowKind>,
        limit: Option<u32>,
    ) -> Result<Vec<CashFlowRecord>, StoreError> {
        self.inner.cash_flows(kind, limit).await
    }

    async fn upsert_dividend(&self, dividend: &DividendRow) -> Result<(), StoreError> {
        self.inner.upsert_dividend(dividend).await
    }

    async fn uninvested_dividends(&self) -> Result<HashMap<Symbol, f64>, StoreError> {
        self.inner.uninvested_dividends().await
    }

    async fn mark_dividends_reinvested(
        &self,
        symbol: &Symbol,
        amount_eur: f64,
    ) -> Result<(), StoreError> {
        self.inner.mark_dividends_reinvested(symbol, amount_eur).await
    }

    async fn allocation_targets(&self) -> Result<Vec<AllocationTarget>, StoreError> {
        self.inner.allocation_targets().await
    }

    async fn upsert_allocation_target(
        &self,
        target: &AllocationTarget,
    ) -> Result<(), StoreError> {
        self.inner.upsert_allocation_target(target).await
    }

    async fn save_score(&self, score: &ScoreRow) -> Result<(), StoreError> {
        self.inner.save_score(score).await
    }

    async fn latest_scores(
        &self,
        symbols: &[Symbol],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<HashMap<Symbol, f64>, StoreError> {
        self.inner.latest_scores(symbols, as_of).await
    }

    async fn upsert_snapshot(&self, snapshot: &SnapshotRow) -> Result<(), StoreError> {
        self.inner.upsert_snapshot(snapshot).await
    }

    async fn snapshots(&self) -> Result<Vec<SnapshotRow>, StoreError> {
        self.inner.snapshots().await
    }

    async fn fx_rate_for_date(
        &self,
        date: NaiveDate,
        currency: &Ccy,
    ) -> Result<Option<f64>, StoreError> {
        self.inner.fx_rate_for_date(date, currency).await
    }

    async fn save_fx_rate(
        &self,
        date: NaiveDate,
        currency: &Ccy,
        rate_to_eur: f64,
    ) -> Result<(), StoreError> {
        self.inner.save_fx_rate(date, currency, rate_to_eur).await
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.cache_get(key).await
    }

    async fn cache_set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        self.inner.cache_set(key, value, ttl_seconds).await
    }

    async fn cache_clear(&self) -> Result<u64, StoreError> {
        self.inner.cache_clear().await
    }

    async fn cache_stats(&self) -> Result<CacheStats, StoreError> {
        self.inner.cache_stats().await
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.setting(key).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_setting(key, value).await
    }

    async fn job_schedules(&self) -> Result<Vec<JobSchedule>, StoreError> {
        self.inner.job_schedules().await
    }

    async fn job_schedule(&self, job_type: &str) -> Result<Option<JobSchedule>, StoreError> {
        self.inner.job_schedule(job_type).await
    }

    async fn upsert_job_schedule(&self, update: &JobScheduleUpdate) -> Result<(), StoreError> {
        self.inner.upsert_job_schedule(update).await
    }

    async fn job_run_state(&self, job_id: &str) -> Result<JobRunState, StoreError> {
        self.inner.job_run_state(job_id).await
    }

    async fn set_job_run_state(
        &self,
        job_id: &str,
        state: JobRunState,
    ) -> Result<(), StoreError> {
        self.inner.set_job_run_state(job_id, state).await
    }

    async fn record_job_history(&self, record: &JobHistoryRecord) -> Result<(), StoreError> {
        self.inner.record_job_history(record).await
    }

    async fn job_history(
        &self,
        prefix: &str,
        limit: Option<u32>,
    ) -> Result<Vec<JobHistoryRecord>, StoreError> {
        self.inner.job_history(prefix, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seeded_live_store(dir: &TempDir) -> SqliteStore {
        let store = SqliteStore::connect(&dir.path().join("live.db"))
            .await
            .unwrap();
        store.set_setting("target_cash_pct", "5").await.unwrap();
        store
            .upsert_security(&Security::new(
                Symbol::new("AAPL.US"),
                "Apple",
                Ccy::new("USD"),
            ))
            .await
            .unwrap();
        store
            .save_prices(
                &Symbol::new("AAPL.US"),
                &[
                    PriceBar::from_close(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 180.0),
                    PriceBar::from_close(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(), 182.0),
                    PriceBar::from_close(NaiveDate::from_ymd_opt(2024, 1, 4).unwrap(), 185.0),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_simulation_store_gates_price_reads_by_simulation_date() {
        let dir = TempDir::new().unwrap();
        let live = seeded_live_store(&dir).await;

        let sim = SimulationStore::create(&dir.path().join("sim.db"))
            .await
            .unwrap();
        sim.initialize_from(&live).await.unwrap();

        sim.set_simulation_date(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        let bars = sim.prices(&Symbol::new("AAPL.US"), None, None).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 182.0);
    }

    #[tokio::test]
    async fn test_simulation_writes_never_reach_source() {
        let dir = TempDir::new().unwrap();
        let live = seeded_live_store(&dir).await;

        let sim = SimulationStore::create(&dir.path().join("sim.db"))
            .await
            .unwrap();
        sim.initialize_from(&live).await.unwrap();

        sim.begin_deferred().await.unwrap();
        sim.set_cash_balance(&Ccy::EUR, 10_000.0).await.unwrap();
        sim.record_trade(&TradeRecord::new(
            String::from("BACKTEST-1"),
            Symbol::new("AAPL.US"),
            sentinel_instrument::Side::Buy,
            5.0,
            180.0,
            0.0,
            Ccy::EUR,
            Utc::now(),
            serde_json::Value::Null,
        ))
        .await
        .unwrap();
        sim.commit_deferred().await.unwrap();

        assert_eq!(sim.trades_count().await.unwrap(), 1);
        assert_eq!(live.trades_count().await.unwrap(), 0);
        assert!(live.cash_balances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_scopes_nest() {
        let dir = TempDir::new().unwrap();
        let sim = SimulationStore::create(&dir.path().join("sim.db"))
            .await
            .unwrap();

        sim.begin_deferred().await.unwrap();
        sim.begin_deferred().await.unwrap();
        sim.set_cash_balance(&Ccy::EUR, 1.0).await.unwrap();
        sim.commit_deferred().await.unwrap();
        sim.set_cash_balance(&Ccy::EUR, 2.0).await.unwrap();
        sim.commit_deferred().await.unwrap();

        assert_eq!(sim.cash_balances().await.unwrap()[&Ccy::EUR], 2.0);
    }
}
