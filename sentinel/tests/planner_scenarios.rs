//! End-to-end planner behaviour over a real (in-process) store and a scripted
//! broker: ideal-weight synthesis, cash-constrained sizing, cooldown symmetry and
//! deficit sells.

mod common;

use common::{MockBroker, context, days_ago, security, store_in, trade};
use sentinel_instrument::{Ccy, Side, Symbol};
use sentinel_store::{Store, position::PositionUpdate, score::ScoreRow};
use std::{collections::HashMap, sync::Arc};
use tempfile::TempDir;

async fn seed_scores(store: &Arc<sentinel_store::sqlite::SqliteStore>, scores: &[(&str, f64)]) {
    for (symbol, score) in scores {
        store
            .save_score(&ScoreRow {
                symbol: Symbol::new(*symbol),
                score: *score,
                components: serde_json::json!({}),
                calculated_at: days_ago(1),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn ideal_portfolio_from_scores_orders_and_normalizes() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    for symbol in ["A.EU", "B.EU", "C.EU"] {
        store.upsert_security(&security(symbol, 1)).await.unwrap();
    }
    seed_scores(&store, &[("A.EU", 0.8), ("B.EU", 0.4), ("C.EU", 0.2)]).await;

    let ctx = context(Arc::clone(&store), broker);
    let ideal = ctx.planner.calculate_ideal_portfolio(None).await.unwrap();

    assert_eq!(ideal.len(), 3);
    let a = ideal[&Symbol::new("A.EU")];
    let b = ideal[&Symbol::new("B.EU")];
    let c = ideal[&Symbol::new("C.EU")];
    assert!(a > b && b > c, "expected A > B > C, got {a} {b} {c}");
    assert!(a > 0.0 && b > 0.0 && c > 0.0);

    let sum: f64 = ideal.values().sum();
    assert!((sum - 0.95).abs() < 1e-6, "sum {sum} should be ~0.95");
}

#[tokio::test]
async fn ideal_weights_respect_bounds_for_flat_scores() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    let symbols: Vec<String> = (0..10).map(|i| format!("S{i}.EU")).collect();
    for symbol in &symbols {
        store.upsert_security(&security(symbol, 1)).await.unwrap();
    }
    let scores: Vec<(&str, f64)> = symbols.iter().map(|s| (s.as_str(), 0.5)).collect();
    seed_scores(&store, &scores).await;

    let ctx = context(Arc::clone(&store), broker);
    let ideal = ctx.planner.calculate_ideal_portfolio(None).await.unwrap();

    assert_eq!(ideal.len(), 10);
    let sum: f64 = ideal.values().sum();
    assert!(sum <= 0.95 + 1e-6);
    for weight in ideal.values() {
        assert!(
            (0.02..=0.20).contains(weight),
            "weight {weight} outside position bounds"
        );
    }
}

#[tokio::test]
async fn cash_constraint_scales_buy_to_budget() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    // Portfolio: 9,500 EUR in a filler position plus 500 EUR cash.
    store.upsert_security(&security("X.EU", 1)).await.unwrap();
    store.upsert_security(&security("Y.EU", 1)).await.unwrap();
    store
        .upsert_position(&PositionUpdate {
            symbol: Symbol::new("Y.EU"),
            quantity: Some(95.0),
            avg_cost: Some(100.0),
            current_price: Some(100.0),
            currency: Some(Ccy::EUR),
        })
        .await
        .unwrap();
    store.set_cash_balance(&Ccy::EUR, 500.0).await.unwrap();
    broker.set_quote("X.EU", 100.0);

    let ctx = context(Arc::clone(&store), broker);
    let ideal = HashMap::from([(Symbol::new("X.EU"), 0.20), (Symbol::new("Y.EU"), 0.95)]);
    let current = HashMap::from([(Symbol::new("Y.EU"), 0.95)]);

    let engine = sentinel::planner::rebalance::RebalanceEngine::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&ctx.broker),
        ctx.portfolio.clone(),
        ctx.settings.clone(),
        ctx.currency.clone(),
    );
    let recommendations = engine
        .get_recommendations(&ideal, &current, 10_000.0, Some(100.0), None)
        .await
        .unwrap();

    // The 2,000 EUR ideal buy shrinks to what 500 EUR of cash affords: 4 shares
    // at 100 EUR plus ~2.8 EUR fee.
    assert_eq!(recommendations.len(), 1);
    let rec = &recommendations[0];
    assert_eq!(rec.symbol, Symbol::new("X.EU"));
    assert_eq!(rec.action, Side::Buy);
    assert_eq!(rec.quantity, 4.0);

    // Budget feasibility: cost including fees stays within cash (1 EUR tolerance).
    let cost = rec.value_delta_eur + 2.0 + rec.value_delta_eur * 0.002;
    assert!(cost <= 500.0 + 1.0, "cost {cost} exceeds budget");

    // Lot validity.
    assert_eq!(rec.quantity % f64::from(rec.lot_size), 0.0);
    assert!(rec.quantity >= f64::from(rec.lot_size));
}

#[tokio::test]
async fn cooloff_blocks_opposite_direction_only() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    store.upsert_security(&security("MSFT.US", 1)).await.unwrap();
    store
        .upsert_position(&PositionUpdate {
            symbol: Symbol::new("MSFT.US"),
            quantity: Some(50.0),
            avg_cost: Some(100.0),
            current_price: Some(100.0),
            currency: Some(Ccy::EUR),
        })
        .await
        .unwrap();
    store.set_cash_balance(&Ccy::EUR, 5_000.0).await.unwrap();
    broker.set_quote("MSFT.US", 100.0);

    // BUY 10 days ago: a SELL is inside the 30-day cool-off.
    store
        .record_trade(&trade(
            "T1",
            "MSFT.US",
            Side::Buy,
            10.0,
            100.0,
            days_ago(10),
        ))
        .await
        .unwrap();

    let ctx = context(Arc::clone(&store), broker);
    let engine = sentinel::planner::rebalance::RebalanceEngine::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&ctx.broker),
        ctx.portfolio.clone(),
        ctx.settings.clone(),
        ctx.currency.clone(),
    );

    let ideal = HashMap::new();
    let current = HashMap::from([(Symbol::new("MSFT.US"), 0.5)]);

    let blocked = engine
        .get_recommendations(&ideal, &current, 10_000.0, Some(100.0), None)
        .await
        .unwrap();
    assert!(
        !blocked.iter().any(|rec| rec.symbol == Symbol::new("MSFT.US")),
        "sell within cool-off must be blocked"
    );

    // Same trade 45 days back: the sell goes through.
    let dir2 = TempDir::new().unwrap();
    let store2 = store_in(&dir2).await;
    let broker2 = Arc::new(MockBroker::new());
    store2.upsert_security(&security("MSFT.US", 1)).await.unwrap();
    store2
        .upsert_position(&PositionUpdate {
            symbol: Symbol::new("MSFT.US"),
            quantity: Some(50.0),
            avg_cost: Some(100.0),
            current_price: Some(100.0),
            currency: Some(Ccy::EUR),
        })
        .await
        .unwrap();
    store2.set_cash_balance(&Ccy::EUR, 5_000.0).await.unwrap();
    broker2.set_quote("MSFT.US", 100.0);
    store2
        .record_trade(&trade(
            "T1",
            "MSFT.US",
            Side::Buy,
            10.0,
            100.0,
            days_ago(45),
        ))
        .await
        .unwrap();

    let ctx2 = context(Arc::clone(&store2), broker2);
    let engine2 = sentinel::planner::rebalance::RebalanceEngine::new(
        Arc::clone(&store2) as Arc<dyn Store>,
        Arc::clone(&ctx2.broker),
        ctx2.portfolio.clone(),
        ctx2.settings.clone(),
        ctx2.currency.clone(),
    );
    let allowed = engine2
        .get_recommendations(&ideal, &current, 10_000.0, Some(100.0), None)
        .await
        .unwrap();
    assert!(
        allowed
            .iter()
            .any(|rec| rec.symbol == Symbol::new("MSFT.US") && rec.action == Side::Sell),
        "sell after cool-off must pass"
    );
}

#[tokio::test]
async fn same_direction_repeat_is_allowed_within_cooloff() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    store.upsert_security(&security("ASML.EU", 1)).await.unwrap();
    store.set_cash_balance(&Ccy::EUR, 10_000.0).await.unwrap();
    broker.set_quote("ASML.EU", 100.0);
    store
        .record_trade(&trade(
            "T1",
            "ASML.EU",
            Side::Buy,
            5.0,
            100.0,
            days_ago(10),
        ))
        .await
        .unwrap();

    let ctx = context(Arc::clone(&store), broker);
    let engine = sentinel::planner::rebalance::RebalanceEngine::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&ctx.broker),
        ctx.portfolio.clone(),
        ctx.settings.clone(),
        ctx.currency.clone(),
    );

    let ideal = HashMap::from([(Symbol::new("ASML.EU"), 0.20)]);
    let current = HashMap::new();

    let recommendations = engine
        .get_recommendations(&ideal, &current, 10_000.0, Some(100.0), None)
        .await
        .unwrap();
    assert!(
        recommendations
            .iter()
            .any(|rec| rec.symbol == Symbol::new("ASML.EU") && rec.action == Side::Buy),
        "same-direction repeat within cool-off must be allowed"
    );
}

#[tokio::test]
async fn deficit_sells_cover_negative_balances() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    // Balances: -5,000 EUR and +100 USD; one sellable USD position.
    let mut aapl = security("AAPL.US", 1);
    aapl.currency = Ccy::new("USD");
    store.upsert_security(&aapl).await.unwrap();
    store
        .upsert_position(&PositionUpdate {
            symbol: Symbol::new("AAPL.US"),
            quantity: Some(10.0),
            avg_cost: Some(150.0),
            current_price: Some(200.0),
            currency: Some(Ccy::new("USD")),
        })
        .await
        .unwrap();
    store.set_cash_balance(&Ccy::EUR, -5_000.0).await.unwrap();
    store
        .set_cash_balance(&Ccy::new("USD"), 100.0)
        .await
        .unwrap();
    // USD at 0.85 EUR (the converter's defaults table value, pinned for clarity).
    store
        .set_setting("exchange_rates", r#"{"EUR":1.0,"USD":0.85}"#)
        .await
        .unwrap();

    let ctx = context(Arc::clone(&store), broker);
    let recommendations = ctx.planner.get_recommendations(None, None).await.unwrap();

    let deficit_sell = recommendations
        .iter()
        .find(|rec| rec.symbol == Symbol::new("AAPL.US") && rec.action == Side::Sell)
        .expect("a deficit sell for AAPL.US");
    assert_eq!(deficit_sell.priority, 1000.0);
    assert!(deficit_sell.reason.contains("deficit"));
}
