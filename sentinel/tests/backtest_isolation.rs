//! Backtest harness behaviour: the live store is never mutated, the simulation
//! produces a result with snapshots, and cancellation emits a terminal event.

mod common;

use common::{MockBroker, days_ago, security, store_in, trending_bars};
use sentinel::backtest::{
    Backtester,
    summary::{BacktestConfig, BacktestEvent, BacktestStatus, RebalanceFrequency},
};
use sentinel_broker::Broker;
use sentinel_instrument::Symbol;
use sentinel_store::Store;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn config(start: chrono::NaiveDate, end: chrono::NaiveDate) -> BacktestConfig {
    BacktestConfig {
        start_date: start,
        end_date: end,
        initial_capital: 10_000.0,
        monthly_deposit: 500.0,
        rebalance_frequency: RebalanceFrequency::Weekly,
        use_existing_universe: true,
        pick_random: false,
        random_count: 10,
        symbols: Vec::new(),
    }
}

async fn seed_live(
    store: &Arc<sentinel_store::sqlite::SqliteStore>,
    symbols: &[&str],
) {
    // Enough rising history before the window for scoring and validation.
    let history_start = common::date(2023, 1, 2);
    for (index, symbol) in symbols.iter().enumerate() {
        store.upsert_security(&security(symbol, 1)).await.unwrap();
        store
            .save_prices(
                &Symbol::new(*symbol),
                &trending_bars(history_start, 420, 50.0 + 10.0 * index as f64, 0.05),
            )
            .await
            .unwrap();
    }
}

async fn collect_events(mut rx: mpsc::Receiver<BacktestEvent>) -> Vec<BacktestEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn backtest_never_mutates_the_live_store() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());

    seed_live(&store, &["AAA.EU", "BBB.EU", "CCC.EU"]).await;

    // A pre-existing live trade row makes count comparisons meaningful.
    store
        .record_trade(&common::trade(
            "LIVE-1",
            "AAA.EU",
            sentinel_instrument::Side::Buy,
            1.0,
            50.0,
            days_ago(200),
        ))
        .await
        .unwrap();

    let trades_before = store.trades_count().await.unwrap();
    let positions_before = store.positions().await.unwrap();
    let snapshots_before = store.snapshots().await.unwrap().len();

    let backtester = Backtester::new(
        config(common::date(2024, 1, 1), common::date(2024, 1, 31)),
        Arc::clone(&store),
        Arc::clone(&broker),
    );
    let (tx, rx) = mpsc::channel(256);
    backtester.run(tx).await;
    let events = collect_events(rx).await;

    // The run completed with a result and daily snapshots.
    let result = events
        .iter()
        .find_map(|event| match event {
            BacktestEvent::Result(result) => Some(result),
            _ => None,
        })
        .expect("backtest emits a result");
    assert!(!result.snapshots.is_empty());
    // 10,000 initial + one monthly deposit on January 1st.
    assert_eq!(result.total_deposits, 10_500.0);

    // Isolation: live rows are untouched.
    assert_eq!(store.trades_count().await.unwrap(), trades_before);
    assert_eq!(store.positions().await.unwrap(), positions_before);
    assert_eq!(store.snapshots().await.unwrap().len(), snapshots_before);
}

#[tokio::test]
async fn backtest_trades_are_lot_valid_and_tracked() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());

    seed_live(&store, &["AAA.EU", "BBB.EU"]).await;

    let backtester = Backtester::new(
        config(common::date(2024, 1, 1), common::date(2024, 2, 15)),
        Arc::clone(&store),
        Arc::clone(&broker),
    );
    let (tx, rx) = mpsc::channel(256);
    backtester.run(tx).await;
    let events = collect_events(rx).await;

    let result = events
        .iter()
        .find_map(|event| match event {
            BacktestEvent::Result(result) => Some(result),
            _ => None,
        })
        .expect("backtest emits a result");

    assert!(
        !result.trades.is_empty(),
        "rising prices and positive scores should produce buys"
    );
    for trade in &result.trades {
        assert_eq!(trade.quantity % 1.0, 0.0);
        assert!(trade.quantity >= 1.0);
    }

    // Per-security tallies line up with the simulated trades.
    let invested: f64 = result
        .trades
        .iter()
        .filter(|t| t.action == sentinel_instrument::Side::Buy)
        .map(|t| t.value_eur)
        .sum();
    let tracked: f64 = result
        .security_performance
        .iter()
        .map(|perf| perf.total_invested)
        .sum();
    assert!((invested - tracked).abs() < 1e-6);

    // The simulated equity stays positive and cash never goes negative.
    for snapshot in &result.snapshots {
        assert!(snapshot.cash_eur >= -1e-6, "cash went negative");
        assert!(snapshot.total_value_eur > 0.0);
    }
}

#[tokio::test]
async fn cancelled_backtest_emits_terminal_event_and_no_result() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());

    seed_live(&store, &["AAA.EU"]).await;

    let backtester = Backtester::new(
        config(common::date(2024, 1, 1), common::date(2024, 6, 28)),
        Arc::clone(&store),
        Arc::clone(&broker),
    );
    // Cancel before it starts: the first day-loop check wins.
    backtester.handle().cancel();

    let (tx, rx) = mpsc::channel(256);
    backtester.run(tx).await;
    let events = collect_events(rx).await;

    assert!(events.iter().any(|event| matches!(
        event,
        BacktestEvent::Progress(progress) if progress.status == BacktestStatus::Cancelled
    )));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, BacktestEvent::Result(_))),
        "cancelled run must not emit a result"
    );
}
