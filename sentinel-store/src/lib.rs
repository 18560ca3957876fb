#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Sentinel-Store
//! Relational persistence for the Sentinel kernel: SQLite tables behind the [`Store`]
//! seam, applied idempotently at startup with an additive-only migration story.
//!
//! Two implementations exist:
//! * [`SqliteStore`] - the live store (WAL journaling, per-write commit).
//! * [`sim::SimulationStore`] - an isolated clone used by the backtester, which gates
//!   all price reads behind a mutable simulation date and batches writes inside one
//!   outer transaction.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sentinel_instrument::{Ccy, Symbol, market::PriceBar};
use std::collections::HashMap;

use crate::{
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

pub mod cash;
pub mod error;
pub mod job;
pub mod position;
pub mod schema;
pub mod score;
pub mod security;
pub mod sim;
pub mod snapshot;
pub mod sqlite;
pub mod target;
pub mod trade;

pub use sqlite::SqliteStore;

/// TTL-backed cache table statistics.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, serde::Deserialize, serde::Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub expired: u64,
}

/// The persistence seam of the system. Every core component reads and writes through
/// a `dyn Store` handle so the backtester can swap in its isolated simulation store.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Securities -------------------------------------------------------------
    async fn security(&self, symbol: &Symbol) -> Result<Option<Security>, StoreError>;
    async fn securities(&self, active_only: bool) -> Result<Vec<Security>, StoreError>;
    async fn upsert_security(&self, security: &Security) -> Result<(), StoreError>;

    // -- Positions --------------------------------------------------------------
    async fn position(&self, symbol: &Symbol) -> Result<Option<Position>, StoreError>;
    /// Active positions only (`quantity > 0`).
    async fn positions(&self) -> Result<Vec<Position>, StoreError>;
    async fn upsert_position(&self, update: &PositionUpdate) -> Result<(), StoreError>;

    // -- Prices -----------------------------------------------------------------
    /// Bars for a symbol, newest-first, optionally bounded by `end_date` and capped
    /// to the most recent `days` rows.
    async fn prices(
        &self,
        symbol: &Symbol,
        days: Option<u32>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<PriceBar>, StoreError>;
    async fn prices_bulk(
        &self,
        symbols: &[Symbol],
        days: Option<u32>,
        end_date: Option<NaiveDate>,
    ) -> Result<HashMap<Symbol, Vec<PriceBar>>, StoreError>;
    async fn save_prices(&self, symbol: &Symbol, bars: &[PriceBar]) -> Result<(), StoreError>;

    // -- Trades -----------------------------------------------------------------
    /// Append a trade; duplicate `broker_trade_id`s are silent no-ops. Returns
    /// whether a row was actually inserted.
    async fn record_trade(&self, trade: &TradeRecord) -> Result<bool, StoreError>;
    /// Trades newest-first, optionally filtered by symbol and capped.
    async fn trades(
        &self,
        symbol: Option<&Symbol>,
        limit: Option<u32>,
    ) -> Result<Vec<TradeRecord>, StoreError>;
    /// All trades in chronological (oldest-first) order, for reconstruction walks.
    async fn trades_chronological(&self) -> Result<Vec<TradeRecord>, StoreError>;
    async fn trades_count(&self) -> Result<u64, StoreError>;

    // -- Cash -------------------------------------------------------------------
    async fn cash_balances(&self) -> Result<HashMap<Ccy, f64>, StoreError>;
    async fn set_cash_balance(&self, currency: &Ccy, amount: f64) -> Result<(), StoreError>;
    /// Reset semantics: replaces the whole mapping, as done on each broker sync.
    async fn replace_cash_balances(&self, balances: &HashMap<Ccy, f64>)
    -> Result<(), StoreError>;
    /// Append a cash flow; duplicate content hashes are silent no-ops.
    async fn record_cash_flow(&self, flow: &CashFlowRecord) -> Result<bool, StoreError>;
    async fn cash_flows(
        &self,
        kind: Option<CashFlowKind>,
        limit: Option<u32>,
    ) -> Result<Vec<CashFlowRecord>, StoreError>;

    // -- Dividend pools ---------------------------------------------------------
    async fn upsert_dividend(&self, dividend: &DividendRow) -> Result<(), StoreError>;
    /// Per-symbol uninvested dividend cash (amount minus reinvested, floored at 0).
    async fn uninvested_dividends(&self) -> Result<HashMap<Symbol, f64>, StoreError>;
    /// Consume up to `amount_eur` of a symbol's pool, oldest rows first.
    async fn mark_dividends_reinvested(
        &self,
        symbol: &Symbol,
        amount_eur: f64,
    ) -> Result<(), StoreError>;

    // -- Allocation targets -----------------------------------------------------
    async fn allocation_targets(&self) -> Result<Vec<AllocationTarget>, StoreError>;
    async fn upsert_allocation_target(&self, target: &AllocationTarget)
    -> Result<(), StoreError>;

    // -- Scores -----------------------------------------------------------------
    async fn save_score(&self, score: &ScoreRow) -> Result<(), StoreError>;
    /// Latest score per symbol, optionally as-of a timestamp (backtest path).
    async fn latest_scores(
        &self,
        symbols: &[Symbol],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<HashMap<Symbol, f64>, StoreError>;

    // -- Snapshots --------------------------------------------------------------
    async fn upsert_snapshot(&self, snapshot: &SnapshotRow) -> Result<(), StoreError>;
    /// All snapshots, oldest-first.
    async fn snapshots(&self) -> Result<Vec<SnapshotRow>, StoreError>;

    // -- FX rate history --------------------------------------------------------
    async fn fx_rate_for_date(
        &self,
        date: NaiveDate,
        currency: &Ccy,
    ) -> Result<Option<f64>, StoreError>;
    async fn save_fx_rate(
        &self,
        date: NaiveDate,
        currency: &Ccy,
        rate_to_eur: f64,
    ) -> Result<(), StoreError>;

    // -- Cache ------------------------------------------------------------------
    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn cache_set(&self, key: &str, value: &str, ttl_seconds: i64)
    -> Result<(), StoreError>;
    async fn cache_clear(&self) -> Result<u64, StoreError>;
    async fn cache_stats(&self) -> Result<CacheStats, StoreError>;

    // -- Settings ---------------------------------------------------------------
    async fn setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    // -- Job schedules ----------------------------------------------------------
    async fn job_schedules(&self) -> Result<Vec<JobSchedule>, StoreError>;
    async fn job_schedule(&self, job_type: &str) -> Result<Option<JobSchedule>, StoreError>;
    async fn upsert_job_schedule(&self, update: &JobScheduleUpdate) -> Result<(), StoreError>;
    async fn job_run_state(&self, job_id: &str) -> Result<JobRunState, StoreError>;
    async fn set_job_run_state(&self, job_id: &str, state: JobRunState)
    -> Result<(), StoreError>;
    async fn record_job_history(&self, record: &JobHistoryRecord) -> Result<(), StoreError>;
    /// History rows whose job id starts with `prefix`, newest-first.
    async fn job_history(
        &self,
        prefix: &str,
        limit: Option<u32>,
    ) -> Result<Vec<JobHistoryRecord>, StoreError>;
}
