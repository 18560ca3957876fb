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

//! # Sentinel
//! Sentinel is a personal-investment automation kernel. It continuously mirrors a
//! brokerage account, scores a universe of securities, derives an ideal portfolio
//! allocation, and recommends or executes trades to converge toward it.
//!
//! At a high level, it provides a few major components:
//! * `Planner` facade composing ideal-allocation synthesis, current-state analysis
//!   and trade-recommendation derivation under cash and cooldown constraints.
//! * `SellScorer` with hard eligibility blocks and a weighted multi-component
//!   sell-priority model.
//! * `JobRuntime` - a self-scheduling, market-aware background job loop with
//!   exponential failure backoff.
//! * `Backtester` - an isolated simulation harness that replays the same `Planner`
//!   day-by-day over history without any chance of touching production data.

use std::{path::PathBuf, sync::Arc};

use sentinel_broker::Broker;
use sentinel_store::Store;

use crate::{
    config::Settings, currency::Currency, planner::Planner, portfolio::Portfolio,
};

/// Typed settings handle over the store's key/value table, with defaults bootstrap.
pub mod config;

/// Cross-rate resolution with EUR as pivot, plus the historical rate cache. (C1)
pub mod currency;

/// Defines all possible errors in Sentinel core.
pub mod error;

/// Provides default Sentinel Tracing logging initialisers.
pub mod logging;

/// Portfolio state: broker mirroring, valuations, allocations and targets. (C2, C6)
pub mod portfolio;

/// Sell scoring, technical scoring and price validation. (C3)
pub mod scoring;

/// Ideal-allocation synthesis, state analysis and rebalance derivation. (C4-C7)
pub mod planner;

/// Scheduled job runtime: expiry predicate, market-timing gates, dispatch. (C8)
pub mod jobs;

/// Daily portfolio snapshot reconstruction from immutable history. (C9)
pub mod snapshot;

/// Isolated backtest harness replaying the Planner over history. (C10)
pub mod backtest;

/// Statistical algorithms shared by the backtest summary and scoring.
///
/// eg/ `max_drawdown`, `sharpe_ratio`, `cagr`.
pub mod statistic;

/// Thin informational HTTP surface (JSON + SSE backtest stream).
pub mod server;

/// Process-wide handles threaded through every component constructor.
///
/// The backtester constructs its own context over a simulation store and broker
/// instead of mutating any global.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn Store>,
    pub broker: Arc<dyn Broker>,
    pub settings: Settings,
    pub currency: Currency,
    pub portfolio: Portfolio,
    pub planner: Planner,
    /// Filesystem path of the live store, when file-backed. Used by the backup job.
    pub store_path: Option<PathBuf>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("store_path", &self.store_path)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Wire up the full component graph over the provided store and broker handles.
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        store_path: Option<PathBuf>,
    ) -> Self {
        let settings = Settings::new(Arc::clone(&store));
        let currency = Currency::new(Arc::clone(&store), Arc::clone(&broker));
        let portfolio = Portfolio::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            currency.clone(),
            settings.clone(),
        );
        let planner = Planner::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            portfolio.clone(),
            currency.clone(),
            settings.clone(),
        );

        Self {
            store,
            broker,
            settings,
            currency,
            portfolio,
            planner,
            store_path,
        }
    }
}

/// Sentinel core test utilities.
pub mod test_utils {
    use chrono::{DateTime, Days, NaiveDate, Utc};
    use sentinel_instrument::market::PriceBar;

    pub fn f64_is_eq(actual: f64, expected: f64, epsilon: f64) -> bool {
        if actual.is_nan() && expected.is_nan() {
            true
        } else if actual.is_infinite() && expected.is_infinite() {
            actual.is_sign_positive() == expected.is_sign_positive()
        } else if actual.is_nan()
            || expected.is_nan()
            || actual.is_infinite()
            || expected.is_infinite()
        {
            false
        } else {
            (actual - expected).abs() < epsilon
        }
    }

    pub fn time_plus_days(base: DateTime<Utc>, plus: u64) -> DateTime<Utc> {
        base.checked_add_days(Days::new(plus)).unwrap()
    }

    pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    /// Flat close series of `len` daily bars ending at `end`, oldest first.
    pub fn flat_bars(end: NaiveDate, len: usize, close: f64) -> Vec<PriceBar> {
        (0..len)
            .rev()
            .map(|offset| {
                PriceBar::from_close(end - chrono::Days::new(offset as u64), close)
            })
            .collect()
    }
}
