//! Sell scorer over a real store: hard blocks and eligible-sizing behaviour.

mod common;

use common::{MockBroker, context, days_ago, security, store_in};
use sentinel::scoring::{SellScorer, sell};
use sentinel_instrument::{Ccy, Symbol};
use sentinel_store::{
    Store,
    position::PositionUpdate,
    target::{AllocationTarget, TargetKind},
};
use std::sync::Arc;
use tempfile::TempDir;

async fn seed_position(
    store: &Arc<sentinel_store::sqlite::SqliteStore>,
    symbol: &str,
    quantity: f64,
    avg_cost: f64,
    current_price: f64,
    held_days: u64,
) {
    let mut sec = security(symbol, 1);
    sec.geography = Some(String::from("US"));
    sec.industry = Some(String::from("Tech"));
    sec.first_bought_at = Some(days_ago(held_days));
    store.upsert_security(&sec).await.unwrap();

    store
        .upsert_position(&PositionUpdate {
            symbol: Symbol::new(symbol),
            quantity: Some(quantity),
            avg_cost: Some(avg_cost),
            current_price: Some(current_price),
            currency: Some(Ccy::EUR),
        })
        .await
        .unwrap();
}

fn scorer(ctx: &sentinel::AppContext) -> SellScorer {
    SellScorer::new(
        Arc::clone(&ctx.store),
        ctx.portfolio.clone(),
        ctx.currency.clone(),
        ctx.settings.clone(),
    )
}

#[tokio::test]
async fn deep_loss_blocks_selling() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    seed_position(&store, "AAPL.US", 10.0, 100.0, 70.0, 365).await;
    store.set_cash_balance(&Ccy::EUR, 9_300.0).await.unwrap();

    let ctx = context(Arc::clone(&store), broker);
    let scores = scorer(&ctx).score_all(None).await.unwrap();

    assert_eq!(scores.len(), 1);
    let verdict = &scores[0];
    assert!(!verdict.eligible);
    let reason = verdict.block_reason.as_deref().unwrap();
    assert!(reason.contains("Loss 30.0%"), "reason was: {reason}");
    assert!(reason.contains("20%"), "reason was: {reason}");
}

#[tokio::test]
async fn profitable_seasoned_position_is_eligible() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    seed_position(&store, "AAPL.US", 10.0, 100.0, 130.0, 365).await;
    store.set_cash_balance(&Ccy::EUR, 8_700.0).await.unwrap();
    store
        .upsert_allocation_target(&AllocationTarget::new(
            TargetKind::Geography,
            String::from("US"),
            0.4,
        ))
        .await
        .unwrap();
    store
        .upsert_allocation_target(&AllocationTarget::new(
            TargetKind::Industry,
            String::from("Tech"),
            0.25,
        ))
        .await
        .unwrap();

    let ctx = context(Arc::clone(&store), broker);
    let scores = scorer(&ctx).score_all(None).await.unwrap();

    assert_eq!(scores.len(), 1);
    let verdict = &scores[0];
    assert!(verdict.eligible, "blocked: {:?}", verdict.block_reason);
    assert!(verdict.total_score > 0.0 && verdict.total_score <= 1.0);
    assert!(
        (sell::MIN_SELL_PCT..=sell::MAX_SELL_PCT).contains(&verdict.suggested_sell_pct),
        "pct {}",
        verdict.suggested_sell_pct
    );
    assert_eq!(verdict.suggested_sell_quantity % 1.0, 0.0);
    // Never liquidates fully: at least one lot remains.
    assert!(verdict.suggested_sell_quantity <= 10.0 - 1.0);
}

#[tokio::test]
async fn allow_sell_flag_blocks() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    seed_position(&store, "AAPL.US", 10.0, 100.0, 130.0, 365).await;
    let mut sec = store.security(&Symbol::new("AAPL.US")).await.unwrap().unwrap();
    sec.allow_sell = false;
    store.upsert_security(&sec).await.unwrap();

    let ctx = context(Arc::clone(&store), broker);
    let scores = scorer(&ctx).score_all(None).await.unwrap();

    assert!(!scores[0].eligible);
    assert_eq!(scores[0].block_reason.as_deref(), Some("allow_sell=false"));
}

#[tokio::test]
async fn young_position_blocks_on_hold_time() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    seed_position(&store, "AAPL.US", 10.0, 100.0, 130.0, 30).await;

    let ctx = context(Arc::clone(&store), broker);
    let scores = scorer(&ctx).score_all(None).await.unwrap();

    assert!(!scores[0].eligible);
    assert!(
        scores[0]
            .block_reason
            .as_deref()
            .unwrap()
            .contains("Held only")
    );
}

#[tokio::test]
async fn recent_transaction_blocks_on_cooldown() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    // Bought long ago but sold recently: cooldown applies to the latest of the two.
    seed_position(&store, "AAPL.US", 10.0, 100.0, 130.0, 400).await;
    let mut sec = store.security(&Symbol::new("AAPL.US")).await.unwrap().unwrap();
    sec.last_sold_at = Some(days_ago(120));
    store.upsert_security(&sec).await.unwrap();

    let ctx = context(Arc::clone(&store), broker);
    let scores = scorer(&ctx).score_all(None).await.unwrap();

    assert!(!scores[0].eligible);
    assert!(
        scores[0]
            .block_reason
            .as_deref()
            .unwrap()
            .contains("cooldown 180")
    );
}

#[tokio::test]
async fn tiny_position_blocks_below_minimum_sell_value() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    let broker = Arc::new(MockBroker::new());

    // Max sell of 40% of 4 shares at 10 EUR rounds to 1 share = 10 EUR < 25 EUR.
    seed_position(&store, "PENNY.EU", 4.0, 8.0, 10.0, 400).await;

    let ctx = context(Arc::clone(&store), broker);
    let scores = scorer(&ctx).score_all(None).await.unwrap();

    assert!(!scores[0].eligible);
    assert_eq!(
        scores[0].block_reason.as_deref(),
        Some("Below minimum sell value")
    );
}
