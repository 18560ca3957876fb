use crate::{
    AppContext,
    backtest::{
        broker::SimulatedBroker,
        builder::BacktestBuilder,
        summary::{
            BacktestConfig, BacktestEvent, BacktestPhase, BacktestProgress, BacktestStatus,
            RebalanceFrequency, SecurityTracking, SimPosition, SimSnapshot, SimulatedTrade,
            calculate_results,
        },
    },
    currency::Currency,
    error::SentinelError,
    planner::models::TradeRecommendation,
};
use chrono::{Datelike, NaiveDate, Weekday};
use parking_lot::Mutex;
use sentinel_broker::Broker;
use sentinel_instrument::{Ccy, Side, Symbol};
use sentinel_store::{
    Store, position::PositionUpdate, sim::SimulationStore, sqlite::SqliteStore,
    trade::TradeRecord,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Simulated broker over the simulation store.
pub mod broker;

/// Build phase: disposable store, universe discovery, price backfill.
pub mod builder;

/// Configuration, events and result metrics.
pub mod summary;

/// Cancellation handle for a running backtest.
#[derive(Debug, Clone, Default)]
pub struct BacktestHandle {
    cancelled: Arc<AtomicBool>,
}

impl BacktestHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The single process-wide "active backtest" cell, used only for cancellation.
static ACTIVE_BACKTEST: Mutex<Option<BacktestHandle>> = Mutex::new(None);

pub fn active_backtest() -> Option<BacktestHandle> {
    ACTIVE_BACKTEST.lock().clone()
}

pub fn set_active_backtest(handle: Option<BacktestHandle>) {
    *ACTIVE_BACKTEST.lock() = handle;
}

/// Isolated backtest harness. (C10)
///
/// Replays the actual Planner day-by-day over an isolated clone of reference data.
/// No write ever reaches the production store; every mutation goes to the
/// per-run simulation store, which is removed on teardown.
pub struct Backtester {
    config: BacktestConfig,
    live_store: Arc<SqliteStore>,
    broker: Arc<dyn Broker>,
    handle: BacktestHandle,
}

impl std::fmt::Debug for Backtester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backtester")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Rebalance cadence: daily, Mondays (with at least 5 days elapsed), or on month
/// boundaries. The first eligible day always rebalances.
fn should_rebalance(
    current: NaiveDate,
    last: Option<NaiveDate>,
    frequency: RebalanceFrequency,
) -> bool {
    let Some(last) = last else {
        return true;
    };
    match frequency {
        RebalanceFrequency::Daily => true,
        RebalanceFrequency::Weekly => {
            current.weekday() == Weekday::Mon && (current - last).num_days() >= 5
        }
        RebalanceFrequency::Monthly => current.month() != last.month(),
    }
}

impl Backtester {
    pub fn new(
        config: BacktestConfig,
        live_store: Arc<SqliteStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            config,
            live_store,
            broker,
            handle: BacktestHandle::default(),
        }
    }

    pub fn handle(&self) -> BacktestHandle {
        self.handle.clone()
    }

    /// Run to completion, emitting `Progress | Result | Error` events. The active
    /// backtest cell is cleared on the way out regardless of outcome.
    pub async fn run(self, events: mpsc::Sender<BacktestEvent>) {
        if let Err(error) = self.run_inner(&events).await {
            let _ = events
                .send(BacktestEvent::Error {
                    message: error.to_string(),
                })
                .await;
        }
        set_active_backtest(None);
    }

    async fn run_inner(&self, events: &mpsc::Sender<BacktestEvent>) -> Result<(), SentinelError> {
        let temp_dir = tempfile::tempdir().map_err(sentinel_store::error::StoreError::Io)?;

        let builder = BacktestBuilder::new(
            self.config.clone(),
            Arc::clone(&self.live_store),
            Arc::clone(&self.broker),
        );
        let Some((sim, _symbols)) = builder
            .build(&temp_dir.path().join("backtest.db"), events)
            .await?
        else {
            return Ok(());
        };
        let sim = Arc::new(sim);

        if self.handle.is_cancelled() {
            self.emit_cancelled(events, None, 0.0).await;
            sim.close().await;
            return Ok(());
        }

        // The whole component graph runs against the simulation store and broker;
        // nothing here can reach the live store.
        let sim_broker: Arc<dyn Broker> = Arc::new(SimulatedBroker::new(Arc::clone(&sim)));
        let ctx = AppContext::new(
            Arc::clone(&sim) as Arc<dyn Store>,
            Arc::clone(&sim_broker),
            None,
        );

        sim.set_cash_balance(&Ccy::EUR, self.config.initial_capital)
            .await?;

        let start_date = self.config.start_date;
        let end_date = self.config.end_date;
        let total_days = (end_date - start_date).num_days().max(1);
        let cooloff_days = ctx.settings.get_i64("trade_cooloff_days", 30).await;

        let mut snapshots: Vec<SimSnapshot> = Vec::new();
        let mut trades: Vec<SimulatedTrade> = Vec::new();
        let mut tracking: HashMap<Symbol, SecurityTracking> = HashMap::new();
        let mut total_deposits = self.config.initial_capital;
        let mut last_rebalance: Option<NaiveDate> = None;
        let mut last_month_deposited: Option<u32> = None;
        let mut days_processed: i64 = 0;

        let mut current = start_date;
        while current <= end_date {
            if self.handle.is_cancelled() {
                let value = snapshots.last().map(|s| s.total_value_eur).unwrap_or(0.0);
                self.emit_cancelled(
                    events,
                    Some(current),
                    days_processed as f64 / total_days as f64 * 100.0,
                )
                .await;
                info!(portfolio_value = value, "backtest cancelled");
                sim.close().await;
                return Ok(());
            }

            // Markets are shut on weekends.
            if matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
                let Some(next) = current.succ_opt() else {
                    break;
                };
                current = next;
                days_processed += 1;
                continue;
            }

            sim.set_simulation_date(current);

            // Monthly deposit lands on the first of the month, once per month.
            if self.config.monthly_deposit > 0.0
                && current.day() == 1
                && last_month_deposited != Some(current.month())
            {
                let cash = sim.cash_balances().await?;
                let eur = cash.get(&Ccy::EUR).copied().unwrap_or(0.0);
                sim.set_cash_balance(&Ccy::EUR, eur + self.config.monthly_deposit)
                    .await?;
                total_deposits += self.config.monthly_deposit;
                last_month_deposited = Some(current.month());
            }

            if should_rebalance(current, last_rebalance, self.config.rebalance_frequency) {
                // Scores are derived inside the simulation from date-gated prices;
                // the clone carries reference tables only, never live score rows.
                let scored_at = current
                    .and_hms_opt(23, 59, 59)
                    .map(|dt| dt.and_utc())
                    .unwrap_or_default();
                crate::jobs::handlers::run_scoring_at(&ctx, scored_at).await?;

                let recommendations =
                    ctx.planner.get_recommendations(None, Some(current)).await?;

                sim.begin_deferred().await?;
                for rec in &recommendations {
                    if self
                        .in_cooloff(&sim, &tracking, rec, current, cooloff_days)
                        .await?
                    {
                        continue;
                    }
                    if let Some(trade) = self
                        .execute_trade(&sim, &ctx.currency, rec, &mut tracking, current)
                        .await?
                    {
                        trades.push(trade);
                    }
                }
                sim.commit_deferred().await?;

                last_rebalance = Some(current);
            }

            self.update_position_prices(&sim, &sim_broker).await?;
            snapshots.push(self.create_snapshot(&sim, &ctx.currency, current).await?);

            if days_processed % 5 == 0 {
                let mut progress = BacktestProgress::phase(
                    BacktestStatus::Running,
                    BacktestPhase::Simulate,
                    "Running simulation...",
                );
                progress.current_date = Some(current);
                progress.progress_pct = days_processed as f64 / total_days as f64 * 100.0;
                progress.portfolio_value = snapshots
                    .last()
                    .map(|s| s.total_value_eur)
                    .unwrap_or(0.0);
                let _ = events.send(BacktestEvent::Progress(progress)).await;
            }

            let Some(next) = current.succ_opt() else {
                break;
            };
            current = next;
            days_processed += 1;
        }

        let result = calculate_results(
            self.config.clone(),
            snapshots,
            trades,
            total_deposits,
            &tracking,
        );
        let _ = events.send(BacktestEvent::Result(Box::new(result))).await;

        sim.close().await;
        Ok(())
    }

    async fn emit_cancelled(
        &self,
        events: &mpsc::Sender<BacktestEvent>,
        current_date: Option<NaiveDate>,
        progress_pct: f64,
    ) {
        let mut progress = BacktestProgress::phase(
            BacktestStatus::Cancelled,
            BacktestPhase::Simulate,
            "Backtest cancelled",
        );
        progress.current_date = current_date;
        progress.progress_pct = progress_pct;
        let _ = events.send(BacktestEvent::Progress(progress)).await;
    }

    /// Cool-off against the simulation's own trade history: an opposite-direction
    /// trade within the window blocks.
    async fn in_cooloff(
        &self,
        sim: &SimulationStore,
        tracking: &HashMap<Symbol, SecurityTracking>,
        rec: &TradeRecommendation,
        current: NaiveDate,
        cooloff_days: i64,
    ) -> Result<bool, SentinelError> {
        let tracked = tracking
            .get(&rec.symbol)
            .and_then(|tally| tally.last_action.zip(tally.last_date));
        let (last_action, last_date) = match tracked {
            Some(pair) => pair,
            None => {
                // Symbols not yet seen in tracking fall back to the sim trades.
                let trades = sim.trades(Some(&rec.symbol), Some(1)).await?;
                let Some(last_trade) = trades.first() else {
                    return Ok(false);
                };
                (last_trade.side, last_trade.executed_at.date_naive())
            }
        };

        let days_since = (current - last_date).num_days();
        Ok(last_action == rec.action.opposite() && days_since < cooloff_days)
    }

    /// Apply one recommendation to the simulated account: verify cash or holdings,
    /// update the position (weighted-average cost on buys), move cash, and record a
    /// synthetic trade row for cool-off tracking.
    async fn execute_trade(
        &self,
        sim: &SimulationStore,
        currency: &Currency,
        rec: &TradeRecommendation,
        tracking: &mut HashMap<Symbol, SecurityTracking>,
        current: NaiveDate,
    ) -> Result<Option<SimulatedTrade>, SentinelError> {
        if rec.quantity <= 0.0 {
            return Ok(None);
        }

        let name = sim
            .security(&rec.symbol)
            .await?
            .map(|security| security.name)
            .unwrap_or_else(|| rec.symbol.to_string());
        let tally = tracking.entry(rec.symbol.clone()).or_default();
        if tally.name.is_empty() {
            tally.name = name;
        }

        let cost_eur = currency
            .to_eur(rec.quantity * rec.price, &rec.currency)
            .await;

        match rec.action {
            Side::Buy => {
                let cash = sim.cash_balances().await?;
                let cash_eur = cash.get(&Ccy::EUR).copied().unwrap_or(0.0);
                if cash_eur < cost_eur {
                    return Ok(None);
                }
                sim.set_cash_balance(&Ccy::EUR, cash_eur - cost_eur).await?;

                let position = sim.position(&rec.symbol).await?;
                let update = match position.filter(|p| p.quantity > 0.0) {
                    Some(position) => {
                        let old_qty = position.quantity;
                        let old_cost = position.avg_cost.unwrap_or(rec.price);
                        let new_qty = old_qty + rec.quantity;
                        let new_avg =
                            (old_qty * old_cost + rec.quantity * rec.price) / new_qty;
                        PositionUpdate {
                            symbol: rec.symbol.clone(),
                            quantity: Some(new_qty),
                            avg_cost: Some(new_avg),
                            current_price: Some(rec.price),
                            currency: Some(rec.currency.clone()),
                        }
                    }
                    None => PositionUpdate {
                        symbol: rec.symbol.clone(),
                        quantity: Some(rec.quantity),
                        avg_cost: Some(rec.price),
                        current_price: Some(rec.price),
                        currency: Some(rec.currency.clone()),
                    },
                };
                sim.upsert_position(&update).await?;

                tally.total_invested += cost_eur;
                tally.num_buys += 1;
            }
            Side::Sell => {
                let Some(position) = sim.position(&rec.symbol).await? else {
                    return Ok(None);
                };
                if position.quantity < rec.quantity {
                    return Ok(None);
                }

                sim.upsert_position(&PositionUpdate {
                    symbol: rec.symbol.clone(),
                    quantity: Some(position.quantity - rec.quantity),
                    avg_cost: None,
                    current_price: Some(rec.price),
                    currency: None,
                })
                .await?;

                let cash = sim.cash_balances().await?;
                let cash_eur = cash.get(&Ccy::EUR).copied().unwrap_or(0.0);
                sim.set_cash_balance(&Ccy::EUR, cash_eur + cost_eur).await?;

                tally.total_sold += cost_eur;
                tally.num_sells += 1;
            }
        }

        // Synthetic trade row so cool-off checks see simulation history.
        let broker_trade_id = format!("BACKTEST-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let executed_at = current
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc())
            .unwrap_or_default();
        sim.record_trade(&TradeRecord {
            broker_trade_id: broker_trade_id.clone(),
            symbol: rec.symbol.clone(),
            side: rec.action,
            quantity: rec.quantity,
            price: rec.price,
            commission: 0.0,
            commission_currency: Ccy::EUR,
            executed_at,
            raw: serde_json::json!({
                "id": broker_trade_id,
                "symbol": rec.symbol,
                "side": rec.action,
                "qty": rec.quantity,
                "price": rec.price,
                "date": current,
                "simulated": true,
            }),
        })
        .await?;

        tally.last_action = Some(rec.action);
        tally.last_date = Some(current);

        Ok(Some(SimulatedTrade {
            date: current,
            symbol: rec.symbol.clone(),
            action: rec.action,
            quantity: rec.quantity,
            price: rec.price,
            value_eur: cost_eur,
        }))
    }

    /// Bring every position's price up to the simulation date.
    async fn update_position_prices(
        &self,
        sim: &SimulationStore,
        sim_broker: &Arc<dyn Broker>,
    ) -> Result<(), SentinelError> {
        for position in sim.positions().await? {
            if let Some(quote) = sim_broker.get_quote(&position.symbol).await? {
                if quote.price > 0.0 {
                    sim.upsert_position(&PositionUpdate::price_only(
                        position.symbol.clone(),
                        quote.price,
                    ))
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        sim: &SimulationStore,
        currency: &Currency,
        date: NaiveDate,
    ) -> Result<SimSnapshot, SentinelError> {
        let mut cash_eur = 0.0;
        for (ccy, amount) in sim.cash_balances().await? {
            cash_eur += currency.to_eur(amount, &ccy).await;
        }

        let mut positions = HashMap::new();
        let mut positions_value_eur = 0.0;
        for position in sim.positions().await? {
            let price = position.price();
            let value_eur = currency
                .to_eur(position.quantity * price, &position.currency)
                .await;
            positions_value_eur += value_eur;
            positions.insert(
                position.symbol.clone(),
                SimPosition {
                    quantity: position.quantity,
                    price,
                    value_eur,
                },
            );
        }

        Ok(SimSnapshot {
            date,
            total_value_eur: cash_eur + positions_value_eur,
            cash_eur,
            positions_value_eur,
            positions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::date;

    #[test]
    fn test_should_rebalance() {
        struct TestCase {
            current: NaiveDate,
            last: Option<NaiveDate>,
            frequency: RebalanceFrequency,
            expected: bool,
        }

        let cases = vec![
            // TC0: first eligible day always rebalances
            TestCase {
                current: date(2024, 3, 6),
                last: None,
                frequency: RebalanceFrequency::Monthly,
                expected: true,
            },
            // TC1: daily always fires
            TestCase {
                current: date(2024, 3, 6),
                last: Some(date(2024, 3, 5)),
                frequency: RebalanceFrequency::Daily,
                expected: true,
            },
            // TC2: weekly needs a Monday...
            TestCase {
                current: date(2024, 3, 6), // Wednesday
                last: Some(date(2024, 2, 26)),
                frequency: RebalanceFrequency::Weekly,
                expected: false,
            },
            // TC3: ...with at least 5 days elapsed
            TestCase {
                current: date(2024, 3, 4), // Monday
                last: Some(date(2024, 3, 1)),
                frequency: RebalanceFrequency::Weekly,
                expected: false,
            },
            TestCase {
                current: date(2024, 3, 4),
                last: Some(date(2024, 2, 26)),
                frequency: RebalanceFrequency::Weekly,
                expected: true,
            },
            // TC5: monthly fires on month change
            TestCase {
                current: date(2024, 4, 1),
                last: Some(date(2024, 3, 29)),
                frequency: RebalanceFrequency::Monthly,
                expected: true,
            },
            TestCase {
                current: date(2024, 3, 29),
                last: Some(date(2024, 3, 1)),
                frequency: RebalanceFrequency::Monthly,
                expected: false,
            },
        ];

        for (index, test) in cases.iter().enumerate() {
            assert_eq!(
                should_rebalance(test.current, test.last, test.frequency),
                test.expected,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_backtest_handle_cancellation() {
        let handle = BacktestHandle::default();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_active_backtest_cell() {
        set_active_backtest(None);
        assert!(active_backtest().is_none());

        let handle = BacktestHandle::default();
        set_active_backtest(Some(handle.clone()));
        active_backtest().unwrap().cancel();
        assert!(handle.is_cancelled());

        set_active_backtest(None);
    }
}
