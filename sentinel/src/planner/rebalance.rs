use crate::{
    config::Settings,
    currency::Currency,
    error::SentinelError,
    planner::{
        ml,
        models::{DEFICIT_SELL_PRIORITY, TradeRecommendation},
    },
    portfolio::Portfolio,
    scoring::{adjust_score_for_conviction, price_validator},
};
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use sentinel_broker::{Broker, types::Quote};
use sentinel_instrument::{Ccy, Side, Symbol, market::PriceBar};
use sentinel_store::{Store, position::Position, security::Security};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Buffer kept above zero when sizing deficit sells, to avoid oscillating around
/// an exactly-zero balance.
const BALANCE_BUFFER_EUR: f64 = 10.0;
const RECOMMENDATIONS_CACHE_TTL_SECONDS: i64 = 300;
/// Allocation deltas below this dead-band are ignored.
const MIN_ALLOCATION_DELTA: f64 = 0.0001;
/// Termination bound for the leftover-budget top-up loop.
const TOP_UP_MAX_ITERATIONS: usize = 1000;

/// Per-symbol market/security inputs resolved once per run.
#[derive(Debug, Clone)]
struct SecurityData {
    price: f64,
    currency: Ccy,
    lot_size: u32,
    current_qty: f64,
    allow_buy: bool,
    allow_sell: bool,
    trade_blocked: bool,
}

/// Target-vs-current delta to rounded, budget-feasible trade list. (C5)
#[derive(Clone)]
pub struct RebalanceEngine {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    portfolio: Portfolio,
    settings: Settings,
    currency: Currency,
}

impl std::fmt::Debug for RebalanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceEngine").finish_non_exhaustive()
    }
}

impl RebalanceEngine {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        portfolio: Portfolio,
        settings: Settings,
        currency: Currency,
    ) -> Self {
        Self {
            store,
            broker,
            portfolio,
            settings,
            currency,
        }
    }

    /// Derive the sorted recommendation list: sells first (deficit sells leading),
    /// then buys by priority descending, all lot-valid, cash-feasible,
    /// cooldown-respecting and above the minimum trade value.
    pub async fn get_recommendations(
        &self,
        ideal: &HashMap<Symbol, f64>,
        current: &HashMap<Symbol, f64>,
        total_value: f64,
        min_trade_value: Option<f64>,
        as_of_date: Option<NaiveDate>,
    ) -> Result<Vec<TradeRecommendation>, SentinelError> {
        let min_trade_value = match min_trade_value {
            Some(value) => value,
            None => self.settings.get_f64("min_trade_value", 100.0).await,
        };

        let cache_key = format!("planner:recommendations:{min_trade_value}");
        if as_of_date.is_none() {
            if let Ok(Some(cached)) = self.store.cache_get(&cache_key).await {
                if let Ok(parsed) = serde_json::from_str(&cached) {
                    return Ok(parsed);
                }
            }
        }

        if total_value == 0.0 {
            return Ok(Vec::new());
        }

        let all_symbols: Vec<Symbol> = ideal
            .keys()
            .chain(current.keys())
            .unique()
            .cloned()
            .sorted()
            .collect();

        let quotes: HashMap<Symbol, Quote> = if as_of_date.is_some() {
            HashMap::new()
        } else {
            match self.broker.get_quotes(&all_symbols).await {
                Ok(quotes) => quotes,
                Err(error) => {
                    debug!(%error, "quote fetch failed, using stored prices");
                    HashMap::new()
                }
            }
        };

        let securities: HashMap<Symbol, Security> = self
            .store
            .securities(false)
            .await?
            .into_iter()
            .map(|security| (security.symbol.clone(), security))
            .collect();
        let positions: HashMap<Symbol, Position> = self
            .store
            .positions()
            .await?
            .into_iter()
            .map(|position| (position.symbol.clone(), position))
            .collect();

        let as_of = as_of_date
            .and_then(|date| date.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc());
        let wavelet_scores = self.store.latest_scores(&all_symbols, as_of).await?;
        let ml_base_url = self
            .settings
            .get_str("ml_service_base_url", "http://localhost:8001")
            .await;
        let ml_scores = ml::fetch_scores(&ml_base_url, &all_symbols, as_of)
            .await
            .unwrap_or_default();

        let hist_prices = self
            .store
            .prices_bulk(&all_symbols, Some(250), as_of_date)
            .await?;
        let validator = price_validator::PriceValidator::new();

        let mut expected_returns: HashMap<Symbol, f64> = HashMap::new();
        let mut security_data: HashMap<Symbol, SecurityData> = HashMap::new();

        for symbol in &all_symbols {
            let security = securities.get(symbol);
            let position = positions.get(symbol);
            let multiplier = security.map(|s| s.user_multiplier).unwrap_or(1.0);

            let base_score = ml_scores
                .get(symbol)
                .or_else(|| wavelet_scores.get(symbol))
                .copied()
                .unwrap_or(0.0);
            expected_returns.insert(
                symbol.clone(),
                adjust_score_for_conviction(base_score, multiplier),
            );

            let hist: Vec<PriceBar> = hist_prices
                .get(symbol)
                .map(|bars| validator.validate_series_desc(bars))
                .unwrap_or_default();

            let price = resolve_price(&quotes, position, &hist, symbol);
            let trade_blocked = check_price_anomaly(price, &hist, symbol);

            security_data.insert(
                symbol.clone(),
                SecurityData {
                    price,
                    currency: security
                        .map(|s| s.currency.clone())
                        .unwrap_or(Ccy::EUR),
                    lot_size: security.map(|s| s.min_lot).unwrap_or(1),
                    current_qty: position.map(|p| p.quantity).unwrap_or(0.0),
                    allow_buy: security.map(|s| s.allow_buy).unwrap_or(true),
                    allow_sell: security.map(|s| s.allow_sell).unwrap_or(true),
                    trade_blocked,
                },
            );
        }

        let mut recommendations = Vec::new();
        for symbol in &all_symbols {
            if let Some(rec) = self
                .build_recommendation(
                    symbol,
                    ideal,
                    current,
                    total_value,
                    &security_data,
                    &expected_returns,
                    min_trade_value,
                    as_of_date,
                )
                .await?
            {
                recommendations.push(rec);
            }
        }

        // Sells as a group first, then by priority descending.
        recommendations.sort_by(|a, b| {
            let a_key = if a.is_sell() { 0 } else { 1 };
            let b_key = if b.is_sell() { 0 } else { 1 };
            a_key
                .cmp(&b_key)
                .then_with(|| b.priority.total_cmp(&a.priority))
        });

        // Solvency sells bypass the score-driven list and lead it.
        let deficit_sells = self.deficit_sells(as_of_date).await?;
        if !deficit_sells.is_empty() {
            let deficit_symbols: std::collections::HashSet<&Symbol> =
                deficit_sells.iter().map(|rec| &rec.symbol).collect();
            recommendations
                .retain(|rec| !(rec.is_sell() && deficit_symbols.contains(&rec.symbol)));
            let mut combined = deficit_sells;
            combined.append(&mut recommendations);
            recommendations = combined;
        }

        let recommendations = self
            .apply_cash_constraint(recommendations, min_trade_value)
            .await?;

        if as_of_date.is_none() {
            if let Ok(document) = serde_json::to_string(&recommendations) {
                if let Err(error) = self
                    .store
                    .cache_set(&cache_key, &document, RECOMMENDATIONS_CACHE_TTL_SECONDS)
                    .await
                {
                    debug!(%error, "failed to cache recommendations");
                }
            }
        }

        Ok(recommendations)
    }

    async fn build_recommendation(
        &self,
        symbol: &Symbol,
        ideal: &HashMap<Symbol, f64>,
        current: &HashMap<Symbol, f64>,
        total_value: f64,
        security_data: &HashMap<Symbol, SecurityData>,
        expected_returns: &HashMap<Symbol, f64>,
        min_trade_value: f64,
        as_of_date: Option<NaiveDate>,
    ) -> Result<Option<TradeRecommendation>, SentinelError> {
        let current_alloc = current.get(symbol).copied().unwrap_or(0.0);
        let target_alloc = ideal.get(symbol).copied().unwrap_or(0.0);
        let delta = target_alloc - current_alloc;

        if delta.abs() < MIN_ALLOCATION_DELTA {
            return Ok(None);
        }

        let Some(data) = security_data.get(symbol) else {
            return Ok(None);
        };
        if data.price <= 0.0 || data.trade_blocked {
            return Ok(None);
        }

        let action = if delta > 0.0 { Side::Buy } else { Side::Sell };

        let cooloff_days = self.settings.get_i64("trade_cooloff_days", 30).await;
        if self
            .cooloff_violation(symbol, action, cooloff_days, as_of_date)
            .await?
        {
            return Ok(None);
        }

        if action == Side::Buy && !data.allow_buy {
            return Ok(None);
        }
        if action == Side::Sell && !data.allow_sell {
            return Ok(None);
        }

        let raw_value_delta = delta * total_value;
        let local_value_delta = if data.currency.is_eur() {
            raw_value_delta
        } else {
            let rate = self.currency.rate(&data.currency).await;
            if rate > 0.0 {
                raw_value_delta / rate
            } else {
                raw_value_delta
            }
        };

        let raw_qty = local_value_delta.abs() / data.price;
        let lot = f64::from(data.lot_size.max(1));
        let mut rounded_qty = (raw_qty / lot).floor() * lot;

        if rounded_qty < lot {
            return Ok(None);
        }

        if action == Side::Sell {
            rounded_qty = rounded_qty.min(data.current_qty);
            if rounded_qty < lot {
                return Ok(None);
            }
        }

        let actual_value_eur = self
            .currency
            .to_eur(rounded_qty * data.price, &data.currency)
            .await;
        if actual_value_eur < min_trade_value {
            return Ok(None);
        }

        let expected_return = expected_returns.get(symbol).copied().unwrap_or(0.0);
        let reason = match action {
            Side::Buy => buy_reason(symbol, expected_return, current_alloc, target_alloc),
            Side::Sell => sell_reason(symbol, expected_return, current_alloc, target_alloc),
        };

        Ok(Some(TradeRecommendation {
            symbol: symbol.clone(),
            action,
            current_allocation: current_alloc,
            target_allocation: target_alloc,
            allocation_delta: delta,
            current_value_eur: current_alloc * total_value,
            target_value_eur: target_alloc * total_value,
            value_delta_eur: if action == Side::Buy {
                actual_value_eur
            } else {
                -actual_value_eur
            },
            quantity: rounded_qty,
            price: data.price,
            currency: data.currency.clone(),
            lot_size: data.lot_size,
            expected_return,
            priority: priority(action, delta, expected_return),
            reason,
            sleeve: String::from("core"),
        }))
    }

    /// A trade is blocked when the most recent trade on the symbol was in the
    /// opposite direction within the cool-off window. Same-direction repeats and
    /// trades beyond the window pass.
    async fn cooloff_violation(
        &self,
        symbol: &Symbol,
        action: Side,
        cooloff_days: i64,
        as_of_date: Option<NaiveDate>,
    ) -> Result<bool, SentinelError> {
        if cooloff_days <= 0 {
            return Ok(false);
        }

        let trades = self.store.trades(Some(symbol), Some(1)).await?;
        let Some(last_trade) = trades.first() else {
            return Ok(false);
        };

        let now: DateTime<Utc> = as_of_date
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);
        let days_since = (now - last_trade.executed_at).num_days();

        Ok(last_trade.side == action.opposite() && days_since < cooloff_days)
    }

    /// Sells generated to restore non-negative cash balances, sized to the
    /// uncovered EUR deficit plus buffer and sorted by (score, position value).
    async fn deficit_sells(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<Vec<TradeRecommendation>, SentinelError> {
        let balances = self.portfolio.cash_balances().await?;

        let mut total_deficit_eur = 0.0;
        for (currency, amount) in &balances {
            if *amount < 0.0 {
                total_deficit_eur +=
                    self.currency.to_eur(amount.abs(), currency).await + BALANCE_BUFFER_EUR;
            }
        }
        if total_deficit_eur == 0.0 {
            return Ok(Vec::new());
        }

        let mut total_positive_eur = 0.0;
        for (currency, amount) in &balances {
            if *amount > 0.0 {
                total_positive_eur += self.currency.to_eur(*amount, currency).await;
            }
        }

        let uncovered = total_deficit_eur - total_positive_eur;
        if uncovered <= 0.0 {
            return Ok(Vec::new());
        }

        self.generate_deficit_sells(uncovered, as_of_date).await
    }

    async fn generate_deficit_sells(
        &self,
        deficit_eur: f64,
        as_of_date: Option<NaiveDate>,
    ) -> Result<Vec<TradeRecommendation>, SentinelError> {
        let positions = self.store.positions().await?;
        if positions.is_empty() {
            return Ok(Vec::new());
        }

        let securities: HashMap<Symbol, Security> = self
            .store
            .securities(false)
            .await?
            .into_iter()
            .map(|security| (security.symbol.clone(), security))
            .collect();

        let symbols: Vec<Symbol> = positions.iter().map(|p| p.symbol.clone()).collect();
        let as_of = as_of_date
            .and_then(|date| date.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc());
        let wavelet_scores = self.store.latest_scores(&symbols, as_of).await?;
        let ml_base_url = self
            .settings
            .get_str("ml_service_base_url", "http://localhost:8001")
            .await;
        let ml_scores = ml::fetch_scores(&ml_base_url, &symbols, as_of)
            .await
            .unwrap_or_default();

        struct DeficitCandidate {
            symbol: Symbol,
            quantity: f64,
            price: f64,
            currency: Ccy,
            lot_size: u32,
            score: f64,
            eur_value: f64,
        }

        let mut candidates = Vec::new();
        for position in &positions {
            if position.quantity <= 0.0 {
                continue;
            }

            let mut price = position.price();
            if let Some(date) = as_of_date {
                let hist = self
                    .store
                    .prices(&position.symbol, Some(1), Some(date))
                    .await?;
                if let Some(bar) = hist.first() {
                    price = bar.close;
                }
            }
            if price <= 0.0 {
                continue;
            }

            let Some(security) = securities.get(&position.symbol) else {
                continue;
            };
            if !security.allow_sell {
                continue;
            }

            let score = ml_scores
                .get(&position.symbol)
                .or_else(|| wavelet_scores.get(&position.symbol))
                .copied()
                .unwrap_or(0.0);
            let eur_value = self
                .currency
                .to_eur(position.quantity * price, &security.currency)
                .await;

            candidates.push(DeficitCandidate {
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                price,
                currency: security.currency.clone(),
                lot_size: security.min_lot,
                score,
                eur_value,
            });
        }

        // Lowest-conviction, smallest positions go first.
        candidates.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.eur_value.total_cmp(&b.eur_value))
        });

        let total_value = self.portfolio.total_value().await?;
        let mut sells = Vec::new();
        let mut remaining_deficit = deficit_eur;

        for candidate in candidates {
            if remaining_deficit <= 0.0 {
                break;
            }

            let lot = f64::from(candidate.lot_size.max(1));
            let sell_qty = if candidate.eur_value <= remaining_deficit {
                (candidate.quantity / lot).floor() * lot
            } else {
                let rate = self.currency.rate(&candidate.currency).await;
                let local_needed = if rate > 0.0 {
                    remaining_deficit / rate
                } else {
                    remaining_deficit
                };
                let shares_needed = local_needed / candidate.price;
                ((shares_needed / lot).ceil() * lot).min(candidate.quantity)
            };

            if sell_qty < lot {
                continue;
            }

            let current_alloc = if total_value > 0.0 {
                candidate.eur_value / total_value
            } else {
                0.0
            };
            let sell_value_eur = self
                .currency
                .to_eur(sell_qty * candidate.price, &candidate.currency)
                .await;

            sells.push(TradeRecommendation {
                symbol: candidate.symbol,
                action: Side::Sell,
                current_allocation: current_alloc,
                target_allocation: 0.0,
                allocation_delta: -current_alloc,
                current_value_eur: candidate.eur_value,
                target_value_eur: candidate.eur_value - sell_value_eur,
                value_delta_eur: -sell_value_eur,
                quantity: sell_qty,
                price: candidate.price,
                currency: candidate.currency,
                lot_size: candidate.lot_size,
                expected_return: candidate.score,
                priority: DEFICIT_SELL_PRIORITY,
                reason: format!(
                    "Sell to cover negative balance deficit ({remaining_deficit:.0} EUR remaining)"
                ),
                sleeve: String::from("core"),
            });

            remaining_deficit -= sell_value_eur;
        }

        Ok(sells)
    }

    /// Scale buys down to the available budget: accept by priority at minimum
    /// viable size, distribute the remainder proportionally to each buy's gap to
    /// its ideal size, then top up one lot at a time while budget remains.
    async fn apply_cash_constraint(
        &self,
        recommendations: Vec<TradeRecommendation>,
        min_trade_value: f64,
    ) -> Result<Vec<TradeRecommendation>, SentinelError> {
        let fixed_fee = self.settings.get_f64("transaction_fee_fixed", 2.0).await;
        let pct_fee = self.settings.get_f64("transaction_fee_percent", 0.2).await / 100.0;

        let (sells, buys): (Vec<_>, Vec<_>) = recommendations
            .into_iter()
            .partition(TradeRecommendation::is_sell);

        if buys.is_empty() {
            return Ok(sells);
        }

        let current_cash = self.portfolio.total_cash_eur().await?;
        let net_sell_proceeds: f64 = sells
            .iter()
            .map(|rec| {
                let value = rec.value_delta_eur.abs();
                value - transaction_cost(value, fixed_fee, pct_fee)
            })
            .sum();
        let available_budget = current_cash + net_sell_proceeds;

        let total_buy_costs: f64 = buys
            .iter()
            .map(|rec| {
                rec.value_delta_eur + transaction_cost(rec.value_delta_eur, fixed_fee, pct_fee)
            })
            .sum();

        if total_buy_costs <= available_budget {
            let mut out = sells;
            out.extend(buys);
            return Ok(out);
        }

        // Over budget: accept buys at minimum viable size, best priority first.
        let buys_by_priority: Vec<TradeRecommendation> = buys
            .into_iter()
            .sorted_by(|a, b| b.priority.total_cmp(&a.priority))
            .collect();

        struct BuyMinimum {
            buy: TradeRecommendation,
            min_eur: f64,
            min_cost: f64,
            ideal_cost: f64,
        }

        let mut buy_minimums = Vec::new();
        for buy in buys_by_priority {
            let lot = f64::from(buy.lot_size.max(1));
            let one_lot_eur = self
                .currency
                .to_eur(lot * buy.price, &buy.currency)
                .await;

            let (min_qty, mut min_eur) = if one_lot_eur >= min_trade_value {
                (lot, one_lot_eur)
            } else if one_lot_eur <= 0.0 {
                continue;
            } else {
                let lots_needed = (min_trade_value / one_lot_eur) as usize + 1;
                (lots_needed as f64 * lot, lots_needed as f64 * one_lot_eur)
            };

            if min_qty > buy.quantity {
                min_eur = self
                    .currency
                    .to_eur(buy.quantity * buy.price, &buy.currency)
                    .await;
            }

            let min_cost = min_eur + transaction_cost(min_eur, fixed_fee, pct_fee);
            let ideal_cost =
                buy.value_delta_eur + transaction_cost(buy.value_delta_eur, fixed_fee, pct_fee);
            buy_minimums.push(BuyMinimum {
                buy,
                min_eur,
                min_cost,
                ideal_cost,
            });
        }

        let mut remaining_budget = available_budget;
        let mut included = Vec::new();
        for item in buy_minimums {
            if item.min_cost <= remaining_budget {
                remaining_budget -= item.min_cost;
                included.push(item);
            }
        }

        if included.is_empty() {
            return Ok(sells);
        }

        // Distribute what is left proportionally to each buy's gap to ideal.
        let total_extra_needed: f64 = included
            .iter()
            .map(|item| (item.ideal_cost - item.min_cost).max(0.0))
            .sum();

        let mut final_buys = Vec::new();
        for item in &included {
            let buy = &item.buy;
            let mut allocated_eur = item.min_eur;

            if total_extra_needed > 0.0 && remaining_budget > 0.0 {
                let extra_needed = (item.ideal_cost - item.min_cost).max(0.0);
                let proportion = extra_needed / total_extra_needed;
                let extra_budget = proportion * remaining_budget;
                allocated_eur += extra_budget / (1.0 + pct_fee);
            }

            let local_value = {
                let rate = self.currency.rate(&buy.currency).await;
                if buy.currency.is_eur() || rate <= 0.0 {
                    allocated_eur
                } else {
                    allocated_eur / rate
                }
            };

            let lot = f64::from(buy.lot_size.max(1));
            let rounded_qty = ((local_value / buy.price) / lot).floor() * lot;
            if rounded_qty < lot {
                continue;
            }

            let actual_eur = self
                .currency
                .to_eur(rounded_qty * buy.price, &buy.currency)
                .await;
            if actual_eur < min_trade_value {
                continue;
            }

            let mut accepted = buy.clone();
            accepted.quantity = rounded_qty;
            accepted.value_delta_eur = actual_eur;
            final_buys.push(accepted);
        }

        final_buys.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        // Top up one lot at a time while leftover budget can absorb it.
        let total_buy_cost: f64 = final_buys
            .iter()
            .map(|buy| {
                buy.value_delta_eur + transaction_cost(buy.value_delta_eur, fixed_fee, pct_fee)
            })
            .sum();
        let mut leftover = available_budget - total_buy_cost;

        let mut iterations = 0;
        while leftover > 0.0 && iterations < TOP_UP_MAX_ITERATIONS {
            iterations += 1;
            let mut added_any = false;

            for buy in final_buys.iter_mut() {
                let lot = f64::from(buy.lot_size.max(1));
                let one_lot_eur = self
                    .currency
                    .to_eur(lot * buy.price, &buy.currency)
                    .await;
                let one_lot_cost = one_lot_eur + transaction_cost(one_lot_eur, fixed_fee, pct_fee);

                if one_lot_cost <= leftover {
                    buy.quantity += lot;
                    buy.value_delta_eur = self
                        .currency
                        .to_eur(buy.quantity * buy.price, &buy.currency)
                        .await;
                    leftover -= one_lot_cost;
                    added_any = true;
                }
            }

            if !added_any {
                break;
            }
        }

        let mut out = sells;
        out.extend(final_buys);
        Ok(out)
    }
}

fn resolve_price(
    quotes: &HashMap<Symbol, Quote>,
    position: Option<&Position>,
    hist_desc: &[PriceBar],
    symbol: &Symbol,
) -> f64 {
    let mut price = quotes.get(symbol).map(|quote| quote.price).unwrap_or(0.0);

    if price <= 0.0 {
        if let Some(position) = position {
            price = position.price();
        }
    }

    if price <= 0.0 {
        price = hist_desc.first().map(|bar| bar.close).unwrap_or(0.0);
    }

    price
}

fn check_price_anomaly(price: f64, hist_desc: &[PriceBar], symbol: &Symbol) -> bool {
    if price <= 0.0 {
        return false;
    }

    let closes_asc: Vec<f64> = hist_desc
        .iter()
        .rev()
        .map(|bar| bar.close)
        .filter(|close| *close > 0.0)
        .collect();
    if closes_asc.is_empty() {
        return false;
    }

    let (allow, reason) =
        price_validator::check_trade_blocking(price, &closes_asc, symbol.as_str());
    if !allow {
        debug!(%symbol, %reason, "price anomaly, skipping recommendation");
    }
    !allow
}

/// Transaction cost: `fixed + value * percent`.
pub fn transaction_cost(value: f64, fixed_fee: f64, pct_fee: f64) -> f64 {
    fixed_fee + value * pct_fee
}

/// Priority: `|delta| * 10 + expected_return` for buys, `- expected_return` for
/// sells (a poor outlook raises sell priority).
pub fn priority(action: Side, allocation_delta: f64, expected_return: f64) -> f64 {
    let base = allocation_delta.abs() * 10.0;
    match action {
        Side::Buy => base + expected_return,
        Side::Sell => base - expected_return,
    }
}

fn buy_reason(
    symbol: &Symbol,
    expected_return: f64,
    current_alloc: f64,
    target_alloc: f64,
) -> String {
    let underweight = (target_alloc - current_alloc) * 100.0;

    if current_alloc == 0.0 {
        format!("New position: {symbol} has expected return of {expected_return:.2}")
    } else if expected_return > 0.3 {
        format!("Underweight by {underweight:.1}%. High expected return ({expected_return:.2})")
    } else if expected_return > 0.0 {
        format!(
            "Underweight by {underweight:.1}%. Positive expected return ({expected_return:.2})"
        )
    } else {
        format!("Underweight by {underweight:.1}% despite neutral outlook")
    }
}

fn sell_reason(
    symbol: &Symbol,
    expected_return: f64,
    current_alloc: f64,
    target_alloc: f64,
) -> String {
    let overweight = (current_alloc - target_alloc) * 100.0;

    if target_alloc == 0.0 {
        if expected_return < 0.0 {
            format!("Exit position: {symbol} has negative expected return ({expected_return:.2})")
        } else {
            format!("Exit position: {symbol} not in ideal portfolio")
        }
    } else if expected_return < 0.0 {
        format!("Overweight by {overweight:.1}%. Negative expected return ({expected_return:.2})")
    } else {
        format!("Overweight by {overweight:.1}%. Reduce to target allocation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transaction_cost() {
        assert_relative_eq!(transaction_cost(400.0, 2.0, 0.002), 2.8);
        assert_relative_eq!(transaction_cost(0.0, 2.0, 0.002), 2.0);
    }

    #[test]
    fn test_priority_direction() {
        // A positive outlook raises buy priority and lowers sell priority.
        assert_relative_eq!(priority(Side::Buy, 0.05, 0.3), 0.8);
        assert_relative_eq!(priority(Side::Sell, -0.05, 0.3), 0.2);
        assert_relative_eq!(priority(Side::Sell, -0.05, -0.3), 0.8);
    }

    #[test]
    fn test_buy_reason_variants() {
        let symbol = Symbol::new("ASML.EU");
        assert!(buy_reason(&symbol, 0.4, 0.0, 0.05).starts_with("New position"));
        assert!(buy_reason(&symbol, 0.4, 0.02, 0.05).contains("High expected return"));
        assert!(buy_reason(&symbol, -0.1, 0.02, 0.05).contains("neutral outlook"));
    }

    #[test]
    fn test_sell_reason_variants() {
        let symbol = Symbol::new("ASML.EU");
        assert!(sell_reason(&symbol, -0.2, 0.05, 0.0).starts_with("Exit position"));
        assert!(sell_reason(&symbol, 0.2, 0.08, 0.05).contains("Reduce to target"));
    }
}
