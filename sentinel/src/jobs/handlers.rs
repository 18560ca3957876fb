//! Handlers for every seeded job type.
//!
//! Handlers return `Err` only for conditions that should count as a failed run and
//! feed the backoff counter; recoverable per-item problems are logged and skipped.

use crate::{
    AppContext,
    error::SentinelError,
    scoring::{price_validator::PriceValidator, technicals},
    snapshot::SnapshotService,
};
use chrono::{DateTime, NaiveDate, Utc};
use sentinel_broker::{Broker, fx};
use sentinel_instrument::{Ccy, Side, Symbol};
use sentinel_store::{
    Store,
    cash::{CashFlowKind, CashFlowRecord, DividendRow},
    job::{JobHistoryRecord, JobRunState, JobStatus},
    position::PositionUpdate,
    score::ScoreRow,
    trade::TradeRecord,
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// Broker history is mirrored from this date forward.
const HISTORY_START: &str = "2020-01-01";
/// Buffer added when sizing balance-fix conversions.
const BALANCE_FIX_BUFFER_EUR: f64 = 10.0;
/// A dividend reduction strictly beyond this fraction counts as a cut.
const DIVIDEND_CUT_THRESHOLD: f64 = 0.20;
/// Store backups kept before the oldest is pruned.
const BACKUP_RETENTION: usize = 5;

fn history_start() -> NaiveDate {
    NaiveDate::parse_from_str(HISTORY_START, "%Y-%m-%d").unwrap_or_default()
}

/// Dispatch a job by type. Unknown types are programming errors and surface as
/// failed jobs.
pub async fn run_job(ctx: &AppContext, job_type: &str) -> Result<(), SentinelError> {
    match job_type {
        "sync:portfolio" => ctx.portfolio.sync().await,
        "sync:prices" => sync_prices(ctx).await,
        "sync:quotes" => sync_quotes(ctx).await,
        "sync:metadata" => sync_metadata(ctx).await,
        "sync:fx" => {
            ctx.currency.sync_rates().await;
            Ok(())
        }
        "sync:trades" => sync_trades(ctx).await,
        "sync:cashflows" => sync_cash_flows(ctx).await,
        "sync:dividends" => sync_dividends(ctx).await,
        "analytics:scoring" => run_scoring(ctx).await,
        "analytics:market-status" => check_market_status(ctx).await,
        "analytics:aggregates" => recompute_aggregates(ctx).await,
        "trading:execute" => execute_recommendations(ctx).await,
        "trading:rebalance" => refresh_rebalance_plan(ctx).await,
        "trading:balance-fix" => fix_balances(ctx).await,
        "maintenance:backup" => backup_store(ctx).await,
        other => Err(SentinelError::Job {
            job_id: other.to_string(),
            detail: String::from("unknown job type"),
        }),
    }
}

/// Record a completed/failed history row for one parameterised work item
/// (`job_type:param` composite id).
async fn record_item_history(
    ctx: &AppContext,
    job_type: &str,
    param: &str,
    started: DateTime<Utc>,
    result: Result<(), String>,
) {
    let job_id = format!("{job_type}:{param}");
    let (status, error) = match result {
        Ok(()) => (JobStatus::Completed, None),
        Err(error) => (JobStatus::Failed, Some(error)),
    };

    let record = JobHistoryRecord {
        job_id: job_id.clone(),
        job_type: job_type.to_string(),
        status,
        error,
        duration_ms: (Utc::now() - started).num_milliseconds().max(0) as u64,
        executed_at: Utc::now(),
        retry_count: 0,
    };
    if let Err(error) = ctx.store.record_job_history(&record).await {
        warn!(%error, %job_id, "failed to record item history");
    }
    let state = JobRunState {
        last_run: Some(Utc::now()),
        consecutive_failures: 0,
    };
    if let Err(error) = ctx.store.set_job_run_state(&job_id, state).await {
        warn!(%error, %job_id, "failed to update item run state");
    }
}

async fn sync_prices(ctx: &AppContext) -> Result<(), SentinelError> {
    let securities = ctx.store.securities(true).await?;
    let symbols: Vec<Symbol> = securities.into_iter().map(|s| s.symbol).collect();
    if symbols.is_empty() {
        return Ok(());
    }

    let fetched = ctx.broker.get_historical_prices_bulk(&symbols, 1).await?;
    for symbol in &symbols {
        let started = Utc::now();
        let result = match fetched.get(symbol) {
            Some(bars) if !bars.is_empty() => ctx
                .store
                .save_prices(symbol, bars)
                .await
                .map_err(|error| error.to_string()),
            _ => Err(String::from("no data returned")),
        };
        record_item_history(ctx, "sync:prices", symbol.as_str(), started, result).await;
    }
    Ok(())
}

async fn sync_quotes(ctx: &AppContext) -> Result<(), SentinelError> {
    let securities = ctx.store.securities(true).await?;
    let symbols: Vec<Symbol> = securities.into_iter().map(|s| s.symbol).collect();
    let quotes = ctx.broker.get_quotes(&symbols).await?;

    for position in ctx.store.positions().await? {
        if let Some(quote) = quotes.get(&position.symbol) {
            if quote.price > 0.0 {
                ctx.store
                    .upsert_position(&PositionUpdate::price_only(
                        position.symbol.clone(),
                        quote.price,
                    ))
                    .await?;
            }
        }
    }
    Ok(())
}

async fn sync_metadata(ctx: &AppContext) -> Result<(), SentinelError> {
    for mut security in ctx.store.securities(true).await? {
        match ctx.broker.get_security_info(&security.symbol).await {
            Ok(Some(info)) => {
                security.name = info.name;
                security.currency = info.currency;
                security.market_id = info.market_id.or(security.market_id);
                security.min_lot = info.min_lot;
                ctx.store.upsert_security(&security).await?;
            }
            Ok(None) => debug!(symbol = %security.symbol, "no metadata returned"),
            Err(error) => debug!(symbol = %security.symbol, %error, "metadata fetch failed"),
        }
    }
    Ok(())
}

async fn sync_trades(ctx: &AppContext) -> Result<(), SentinelError> {
    let today = Utc::now().date_naive();
    let trades = ctx
        .broker
        .get_trades_history(history_start(), today)
        .await?;

    let mut inserted = 0_usize;
    for trade in &trades {
        let record = TradeRecord {
            broker_trade_id: trade.trade_id.clone(),
            symbol: trade.symbol.clone(),
            side: trade.side,
            quantity: trade.quantity,
            price: trade.price,
            commission: trade.commission,
            commission_currency: trade.commission_currency.clone(),
            executed_at: trade.executed_at,
            raw: trade.raw.clone(),
        };

        if ctx.store.record_trade(&record).await? {
            inserted += 1;
            update_security_trade_dates(ctx, &record).await?;
        }
    }

    info!(total = trades.len(), inserted, "trade history synced");
    Ok(())
}

/// Maintain `first_bought_at` / `last_sold_at` on the security from newly mirrored
/// trades; the sell scorer's hold and cooldown gates read these.
async fn update_security_trade_dates(
    ctx: &AppContext,
    trade: &TradeRecord,
) -> Result<(), SentinelError> {
    let Some(mut security) = ctx.store.security(&trade.symbol).await? else {
        return Ok(());
    };

    let mut changed = false;
    match trade.side {
        Side::Buy => {
            if security
                .first_bought_at
                .is_none_or(|existing| trade.executed_at < existing)
            {
                security.first_bought_at = Some(trade.executed_at);
                changed = true;
            }
        }
        Side::Sell => {
            if security
                .last_sold_at
                .is_none_or(|existing| trade.executed_at > existing)
            {
                security.last_sold_at = Some(trade.executed_at);
                changed = true;
            }
        }
    }

    if changed {
        ctx.store.upsert_security(&security).await?;
    }
    Ok(())
}

fn map_flow_kind(type_id: &str) -> Option<CashFlowKind> {
    match type_id {
        "card" | "deposit" => Some(CashFlowKind::Deposit),
        "card_payout" | "withdrawal" => Some(CashFlowKind::Withdrawal),
        "dividend" => Some(CashFlowKind::Dividend),
        "tax" => Some(CashFlowKind::Tax),
        "block" => Some(CashFlowKind::Block),
        "unblock" => Some(CashFlowKind::Unblock),
        _ => None,
    }
}

/// First whitespace token containing a '.' looks like a broker symbol.
fn symbol_from_comment(comment: &str) -> Option<Symbol> {
    comment
        .split_whitespace()
        .find(|token| token.contains('.') && !token.ends_with('.'))
        .map(Symbol::new)
}

async fn sync_cash_flows(ctx: &AppContext) -> Result<(), SentinelError> {
    let today = Utc::now().date_naive();
    let flows = ctx.broker.get_cash_flows(history_start(), today).await?;

    for flow in &flows {
        let Some(kind) = map_flow_kind(&flow.type_id) else {
            debug!(type_id = %flow.type_id, "skipping unknown cash flow type");
            continue;
        };

        let record = CashFlowRecord::new(
            flow.date,
            kind,
            flow.amount,
            flow.currency.clone(),
            flow.comment.clone(),
            flow.raw.clone(),
        );

        let inserted = ctx.store.record_cash_flow(&record).await?;

        // New dividends feed the per-symbol reinvestment pools.
        if inserted && kind == CashFlowKind::Dividend {
            if let Some(symbol) = flow.comment.as_deref().and_then(symbol_from_comment) {
                let amount_eur = ctx
                    .currency
                    .to_eur_for_date(flow.amount, &flow.currency, flow.date)
                    .await;
                ctx.store
                    .upsert_dividend(&DividendRow {
                        symbol,
                        date: flow.date,
                        amount_eur,
                        reinvested_eur: 0.0,
                    })
                    .await?;
            }
        }
    }
    Ok(())
}

async fn sync_dividends(ctx: &AppContext) -> Result<(), SentinelError> {
    let today = Utc::now().date_naive();
    let actions = ctx
        .broker
        .get_corporate_actions(history_start(), today)
        .await?;

    let mut per_symbol: std::collections::HashMap<Symbol, Vec<(NaiveDate, f64)>> =
        std::collections::HashMap::new();

    for action in &actions {
        let is_dividend = action
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| t.eq_ignore_ascii_case("dividend"));
        if !is_dividend {
            continue;
        }

        let Some(symbol) = action
            .get("instr_nm")
            .or_else(|| action.get("symbol"))
            .and_then(Value::as_str)
            .map(Symbol::new)
        else {
            continue;
        };
        let Some(date) = action
            .get("date")
            .and_then(Value::as_str)
            .and_then(|raw| NaiveDate::parse_from_str(&raw[..raw.len().min(10)], "%Y-%m-%d").ok())
        else {
            continue;
        };
        let Some(amount) = action
            .get("amount")
            .or_else(|| action.get("sum"))
            .and_then(Value::as_f64)
        else {
            continue;
        };
        let currency = action
            .get("curr")
            .and_then(Value::as_str)
            .map(Ccy::new)
            .unwrap_or(Ccy::EUR);

        let amount_eur = ctx.currency.to_eur_for_date(amount, &currency, date).await;
        ctx.store
            .upsert_dividend(&DividendRow {
                symbol: symbol.clone(),
                date,
                amount_eur,
                reinvested_eur: 0.0,
            })
            .await?;
        per_symbol.entry(symbol).or_default().push((date, amount_eur));
    }

    // Dividend-cut detection: a strict drop beyond the threshold. A reduction of
    // exactly the threshold does not trigger.
    for (symbol, mut payments) in per_symbol {
        payments.sort_by_key(|(date, _)| *date);
        if let [.., (_, previous), (_, latest)] = payments.as_slice() {
            if *previous > 0.0 {
                let change = latest / previous - 1.0;
                if change < -DIVIDEND_CUT_THRESHOLD {
                    warn!(%symbol, change, "dividend cut detected");
                }
            }
        }
    }

    Ok(())
}

async fn run_scoring(ctx: &AppContext) -> Result<(), SentinelError> {
    run_scoring_at(ctx, Utc::now()).await
}

/// Score every active security from its (possibly date-gated) price history. The
/// backtester calls this with its simulation clock so score rows line up with the
/// simulated day.
pub async fn run_scoring_at(ctx: &AppContext, now: DateTime<Utc>) -> Result<(), SentinelError> {
    let validator = PriceValidator::new();
    let mut scored = 0_usize;

    for security in ctx.store.securities(true).await? {
        let bars_desc = ctx.store.prices(&security.symbol, Some(400), None).await?;
        let mut ascending = bars_desc;
        ascending.reverse();
        let validated = validator.validate_and_interpolate(&ascending);

        let Some((score, components)) = technicals::composite_score(&validated) else {
            debug!(symbol = %security.symbol, "insufficient history for scoring");
            continue;
        };

        ctx.store
            .save_score(&ScoreRow {
                symbol: security.symbol.clone(),
                score,
                components,
                calculated_at: now,
            })
            .await?;
        scored += 1;
    }

    info!(scored, "scoring run complete");
    Ok(())
}

async fn check_market_status(ctx: &AppContext) -> Result<(), SentinelError> {
    let market_ids: std::collections::HashSet<String> = ctx
        .store
        .securities(true)
        .await?
        .into_iter()
        .filter_map(|security| security.market_id)
        .collect();

    let mut status = serde_json::Map::new();
    for market_id in market_ids {
        let open = ctx
            .broker
            .is_market_open(&market_id)
            .await
            .unwrap_or(false);
        status.insert(market_id, json!(open));
    }

    ctx.store
        .cache_set("markets:status", &Value::Object(status).to_string(), 900)
        .await?;
    Ok(())
}

async fn recompute_aggregates(ctx: &AppContext) -> Result<(), SentinelError> {
    let allocations = ctx.portfolio.allocations().await?;
    let document = json!({
        "by_security": allocations.by_security,
        "by_geography": allocations.by_geography,
        "by_industry": allocations.by_industry,
    });
    ctx.store
        .cache_set("portfolio:allocations", &document.to_string(), 3_600)
        .await?;

    SnapshotService::new(
        std::sync::Arc::clone(&ctx.store),
        std::sync::Arc::clone(&ctx.broker),
        ctx.currency.clone(),
    )
    .backfill()
    .await
}

async fn refresh_rebalance_plan(ctx: &AppContext) -> Result<(), SentinelError> {
    let recommendations = ctx.planner.get_recommendations(None, None).await?;
    info!(
        count = recommendations.len(),
        "rebalance plan refreshed"
    );
    Ok(())
}

async fn execute_recommendations(ctx: &AppContext) -> Result<(), SentinelError> {
    let recommendations = ctx.planner.get_recommendations(None, None).await?;

    for rec in &recommendations {
        // Asian-market orders need a limit price; others go at market.
        let price = rec.symbol.is_asian_market().then_some(rec.price);

        let submitted = match rec.action {
            Side::Buy => ctx.broker.buy(&rec.symbol, rec.quantity, price).await,
            Side::Sell => ctx.broker.sell(&rec.symbol, rec.quantity, price).await,
        };

        match submitted {
            Ok(Some(order_id)) => {
                info!(symbol = %rec.symbol, action = %rec.action, quantity = rec.quantity, %order_id, "order submitted");

                // Buying consumes the symbol's uninvested dividend pool.
                if rec.action == Side::Buy {
                    ctx.store
                        .mark_dividends_reinvested(&rec.symbol, rec.value_delta_eur)
                        .await?;
                }
            }
            Ok(None) => warn!(symbol = %rec.symbol, "order not accepted"),
            Err(error) => warn!(symbol = %rec.symbol, %error, "order submission failed"),
        }
    }

    Ok(())
}

/// Convert surplus cash along the fixed FX routing table to cover negative
/// balances (plus buffer). Research mode short-circuits at the broker.
async fn fix_balances(ctx: &AppContext) -> Result<(), SentinelError> {
    let balances = ctx.store.cash_balances().await?;

    let deficits: Vec<(Ccy, f64)> = balances
        .iter()
        .filter(|(_, amount)| **amount < 0.0)
        .map(|(currency, amount)| (currency.clone(), amount.abs()))
        .collect();
    if deficits.is_empty() {
        return Ok(());
    }

    // Largest surplus first.
    let mut surpluses: Vec<(Ccy, f64)> = Vec::new();
    for (currency, amount) in &balances {
        if *amount > 0.0 {
            let eur = ctx.currency.to_eur(*amount, currency).await;
            surpluses.push((currency.clone(), eur));
        }
    }
    surpluses.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (deficit_ccy, deficit_amount) in deficits {
        let needed = deficit_amount + BALANCE_FIX_BUFFER_EUR;

        let Some((surplus_ccy, route)) = surpluses
            .iter()
            .find_map(|(surplus_ccy, _)| {
                fx::route(surplus_ccy, &deficit_ccy).map(|route| (surplus_ccy, route))
            })
        else {
            warn!(%deficit_ccy, "no FX route from any surplus currency");
            continue;
        };
        let mut amount = ctx
            .currency
            .convert(needed, &deficit_ccy, surplus_ccy)
            .await;

        for hop in &route.hops {
            let submitted = match hop.side {
                Side::Buy => ctx.broker.buy(&hop.pair, amount, None).await,
                Side::Sell => ctx.broker.sell(&hop.pair, amount, None).await,
            };
            match submitted {
                Ok(Some(order_id)) => {
                    info!(pair = %hop.pair, side = %hop.side, amount, %order_id, "conversion submitted")
                }
                Ok(None) => {
                    warn!(pair = %hop.pair, "conversion not accepted");
                    break;
                }
                Err(error) => {
                    warn!(pair = %hop.pair, %error, "conversion failed");
                    break;
                }
            }
            // Two-hop routes pass through EUR.
            amount = ctx.currency.convert(amount, surplus_ccy, &Ccy::EUR).await;
        }
    }

    Ok(())
}

async fn backup_store(ctx: &AppContext) -> Result<(), SentinelError> {
    let Some(path) = ctx.store_path.as_ref() else {
        debug!("store is not file-backed, skipping backup");
        return Ok(());
    };

    let backup_dir = path
        .parent()
        .map(|parent| parent.join("backups"))
        .unwrap_or_else(|| std::path::PathBuf::from("backups"));
    std::fs::create_dir_all(&backup_dir).map_err(sentinel_store::error::StoreError::Io)?;

    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let target = backup_dir.join(format!("sentinel-{stamp}.db"));
    std::fs::copy(path, &target).map_err(sentinel_store::error::StoreError::Io)?;
    info!(target = %target.display(), "store backed up");

    // Prune to the newest BACKUP_RETENTION files.
    let mut backups: Vec<_> = std::fs::read_dir(&backup_dir)
        .map_err(sentinel_store::error::StoreError::Io)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("sentinel-") && name.ends_with(".db"))
        })
        .collect();
    backups.sort();
    while backups.len() > BACKUP_RETENTION {
        let oldest = backups.remove(0);
        if let Err(error) = std::fs::remove_file(&oldest) {
            warn!(%error, path = %oldest.display(), "failed to prune backup");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_flow_kind() {
        assert_eq!(map_flow_kind("card"), Some(CashFlowKind::Deposit));
        assert_eq!(map_flow_kind("card_payout"), Some(CashFlowKind::Withdrawal));
        assert_eq!(map_flow_kind("dividend"), Some(CashFlowKind::Dividend));
        assert_eq!(map_flow_kind("interest"), None);
    }

    #[test]
    fn test_symbol_from_comment() {
        assert_eq!(
            symbol_from_comment("AAPL.US dividend payment"),
            Some(Symbol::new("AAPL.US"))
        );
        assert_eq!(
            symbol_from_comment("Dividend for ASML.EU 2024"),
            Some(Symbol::new("ASML.EU"))
        );
        assert_eq!(symbol_from_comment("monthly deposit"), None);
    }
}
