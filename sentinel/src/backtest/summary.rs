//! Backtest configuration, progress events and result metrics.

use crate::statistic;
use chrono::NaiveDate;
use sentinel_instrument::{Side, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_initial_capital() -> f64 {
    10_000.0
}

fn default_true() -> bool {
    true
}

fn default_random_count() -> usize {
    10
}

/// How often the simulation calls the Planner.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceFrequency {
    Daily,
    #[default]
    Weekly,
    Monthly,
}

/// Configuration for one backtest run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BacktestConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    #[serde(default)]
    pub monthly_deposit: f64,
    #[serde(default)]
    pub rebalance_frequency: RebalanceFrequency,
    /// Universe selection: existing active set, random broker sample, or explicit.
    #[serde(default = "default_true")]
    pub use_existing_universe: bool,
    #[serde(default = "default_true")]
    pub pick_random: bool,
    #[serde(default = "default_random_count")]
    pub random_count: usize,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
}

/// Lifecycle phase of a backtest run.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestPhase {
    PrepareStore,
    DiscoverSymbols,
    DownloadPrices,
    Simulate,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    Preparing,
    Discovering,
    Downloading,
    Running,
    Completed,
    Error,
    Cancelled,
}

/// Progress update emitted during a backtest run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BacktestProgress {
    pub current_date: Option<NaiveDate>,
    pub progress_pct: f64,
    pub portfolio_value: f64,
    pub status: BacktestStatus,
    pub message: String,
    pub phase: Option<BacktestPhase>,
    pub current_item: Option<Symbol>,
    pub items_done: usize,
    pub items_total: usize,
}

impl BacktestProgress {
    pub fn phase(status: BacktestStatus, phase: BacktestPhase, message: &str) -> Self {
        Self {
            current_date: None,
            progress_pct: 0.0,
            portfolio_value: 0.0,
            status,
            message: message.to_string(),
            phase: Some(phase),
            current_item: None,
            items_done: 0,
            items_total: 0,
        }
    }
}

/// Per-symbol entry of a simulated daily snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimPosition {
    pub quantity: f64,
    pub price: f64,
    pub value_eur: f64,
}

/// Daily snapshot of the simulated portfolio state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimSnapshot {
    pub date: NaiveDate,
    pub total_value_eur: f64,
    pub cash_eur: f64,
    pub positions_value_eur: f64,
    pub positions: HashMap<Symbol, SimPosition>,
}

/// A trade executed during simulation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulatedTrade {
    pub date: NaiveDate,
    pub symbol: Symbol,
    pub action: Side,
    pub quantity: f64,
    pub price: f64,
    pub value_eur: f64,
}

/// Performance breakdown for a single security over the simulation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SecurityPerformance {
    pub symbol: Symbol,
    pub name: String,
    pub total_invested: f64,
    pub total_sold: f64,
    pub final_value: f64,
    pub total_return: f64,
    pub return_pct: f64,
    pub num_buys: usize,
    pub num_sells: usize,
}

/// Final results of a backtest run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BacktestResult {
    pub config: BacktestConfig,
    pub snapshots: Vec<SimSnapshot>,
    pub trades: Vec<SimulatedTrade>,
    pub initial_value: f64,
    pub final_value: f64,
    pub total_deposits: f64,
    pub total_return: f64,
    pub total_return_pct: f64,
    /// Percent per annum over the elapsed period, based on deposits.
    pub cagr: f64,
    /// Largest peak-to-trough decline of the equity curve, in percent.
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub security_performance: Vec<SecurityPerformance>,
}

/// Event stream emitted by a backtest run: finite, non-restartable.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BacktestEvent {
    Progress(BacktestProgress),
    Result(Box<BacktestResult>),
    Error { message: String },
}

/// Per-symbol running tallies kept while executing simulated trades.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityTracking {
    pub name: String,
    pub total_invested: f64,
    pub total_sold: f64,
    pub num_buys: usize,
    pub num_sells: usize,
    pub last_action: Option<Side>,
    pub last_date: Option<NaiveDate>,
}

/// Compute result metrics from the simulated equity curve and tallies.
pub fn calculate_results(
    config: BacktestConfig,
    snapshots: Vec<SimSnapshot>,
    trades: Vec<SimulatedTrade>,
    total_deposits: f64,
    tracking: &HashMap<Symbol, SecurityTracking>,
) -> BacktestResult {
    if snapshots.is_empty() {
        return BacktestResult {
            initial_value: config.initial_capital,
            final_value: config.initial_capital,
            config,
            snapshots: Vec::new(),
            trades: Vec::new(),
            total_deposits,
            total_return: 0.0,
            total_return_pct: 0.0,
            cagr: 0.0,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
            security_performance: Vec::new(),
        };
    }

    let initial_value = snapshots[0].total_value_eur;
    let final_value = snapshots[snapshots.len() - 1].total_value_eur;
    let values: Vec<f64> = snapshots.iter().map(|s| s.total_value_eur).collect();

    let total_return = final_value - total_deposits;
    let total_return_pct = if total_deposits > 0.0 {
        total_return / total_deposits * 100.0
    } else {
        0.0
    };

    let years = (config.end_date - config.start_date).num_days() as f64 / 365.25;
    let cagr = statistic::cagr(final_value, total_deposits, years) * 100.0;
    let max_drawdown = statistic::max_drawdown(&values) * 100.0;
    let sharpe_ratio = statistic::sharpe_ratio(&statistic::daily_returns(&values));

    let last_snapshot = &snapshots[snapshots.len() - 1];
    let mut security_performance: Vec<SecurityPerformance> = tracking
        .iter()
        .map(|(symbol, tally)| {
            let final_value_sec = last_snapshot
                .positions
                .get(symbol)
                .map(|p| p.value_eur)
                .unwrap_or(0.0);
            let total_return_sec = final_value_sec + tally.total_sold - tally.total_invested;
            let return_pct = if tally.total_invested > 0.0 {
                total_return_sec / tally.total_invested * 100.0
            } else {
                0.0
            };

            SecurityPerformance {
                symbol: symbol.clone(),
                name: tally.name.clone(),
                total_invested: tally.total_invested,
                total_sold: tally.total_sold,
                final_value: final_value_sec,
                total_return: total_return_sec,
                return_pct,
                num_buys: tally.num_buys,
                num_sells: tally.num_sells,
            }
        })
        .collect();
    security_performance.sort_by(|a, b| b.total_return.total_cmp(&a.total_return));

    BacktestResult {
        config,
        snapshots,
        trades,
        initial_value,
        final_value,
        total_deposits,
        total_return,
        total_return_pct,
        cagr,
        max_drawdown,
        sharpe_ratio,
        security_performance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::date;
    use approx::assert_relative_eq;

    fn snapshot(date: NaiveDate, total: f64) -> SimSnapshot {
        SimSnapshot {
            date,
            total_value_eur: total,
            cash_eur: total,
            positions_value_eur: 0.0,
            positions: HashMap::new(),
        }
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            start_date: date(2023, 1, 1),
            end_date: date(2024, 1, 1),
            initial_capital: 10_000.0,
            monthly_deposit: 0.0,
            rebalance_frequency: RebalanceFrequency::Weekly,
            use_existing_universe: true,
            pick_random: false,
            random_count: 10,
            symbols: Vec::new(),
        }
    }

    #[test]
    fn test_calculate_results_empty_snapshots() {
        let result =
            calculate_results(config(), Vec::new(), Vec::new(), 10_000.0, &HashMap::new());
        assert_eq!(result.final_value, 10_000.0);
        assert_eq!(result.total_return, 0.0);
        assert_eq!(result.cagr, 0.0);
    }

    #[test]
    fn test_calculate_results_metrics() {
        let snapshots = vec![
            snapshot(date(2023, 1, 2), 10_000.0),
            snapshot(date(2023, 6, 1), 9_000.0),
            snapshot(date(2024, 1, 1), 12_000.0),
        ];

        let result =
            calculate_results(config(), snapshots, Vec::new(), 10_000.0, &HashMap::new());
        assert_relative_eq!(result.total_return, 2_000.0);
        assert_relative_eq!(result.total_return_pct, 20.0);
        assert_relative_eq!(result.max_drawdown, 10.0, epsilon = 1e-9);
        assert!(result.cagr > 19.0 && result.cagr < 21.0);
    }

    #[test]
    fn test_security_performance_accounts_for_sales() {
        let mut positions = HashMap::new();
        positions.insert(
            Symbol::new("AAPL.US"),
            SimPosition {
                quantity: 5.0,
                price: 110.0,
                value_eur: 550.0,
            },
        );
        let snapshots = vec![SimSnapshot {
            date: date(2024, 1, 1),
            total_value_eur: 10_000.0,
            cash_eur: 9_450.0,
            positions_value_eur: 550.0,
            positions,
        }];

        let tracking = HashMap::from([(
            Symbol::new("AAPL.US"),
            SecurityTracking {
                name: String::from("Apple"),
                total_invested: 1_000.0,
                total_sold: 600.0,
                num_buys: 2,
                num_sells: 1,
                last_action: Some(Side::Sell),
                last_date: Some(date(2023, 6, 1)),
            },
        )]);

        let result =
            calculate_results(config(), snapshots, Vec::new(), 10_000.0, &tracking);
        let perf = &result.security_performance[0];
        assert_relative_eq!(perf.total_return, 550.0 + 600.0 - 1_000.0);
        assert_relative_eq!(perf.return_pct, 15.0);
        assert_eq!(perf.num_buys, 2);
    }

    #[test]
    fn test_event_serialisation_tags() {
        let event = BacktestEvent::Error {
            message: String::from("boom"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
    }
}
