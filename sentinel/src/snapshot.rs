//! Daily portfolio snapshot reconstruction. (C9)
//!
//! Rebuilds the equity curve from immutable trades + price history + FX history so
//! it survives data corrections. Cost basis converts at the FX rate of the trade
//! date; valuation converts at the rate of the snapshot date. On sells the cost
//! basis shrinks proportionally (weighted average).

use crate::{currency::Currency, error::SentinelError, scoring::price_validator::PriceValidator};
use chrono::{Days, NaiveDate, Utc};
use sentinel_broker::Broker;
use sentinel_instrument::{Ccy, Symbol};
use sentinel_store::{
    Store,
    snapshot::{SnapshotPosition, SnapshotRow},
};
use std::{collections::HashMap, sync::Arc};
use tracing::info;

/// Infer the trading currency for symbols missing from the securities table.
fn currency_from_suffix(symbol: &Symbol) -> Ccy {
    let s = symbol.as_str();
    if s.ends_with(".US") {
        Ccy::new("USD")
    } else if s.ends_with(".AS") {
        Ccy::new("HKD")
    } else {
        Ccy::EUR
    }
}

/// Most recent close on or before `date` in an ascending `(date, close)` series.
fn close_at_or_before(series: &[(NaiveDate, f64)], date: NaiveDate) -> Option<f64> {
    let idx = series.partition_point(|(d, _)| *d <= date);
    (idx > 0).then(|| series[idx - 1].1)
}

/// Reconstructs daily portfolio snapshots from trades + prices + FX.
#[derive(Clone)]
pub struct SnapshotService {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    currency: Currency,
}

impl std::fmt::Debug for SnapshotService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotService").finish_non_exhaustive()
    }
}

impl SnapshotService {
    pub fn new(store: Arc<dyn Store>, broker: Arc<dyn Broker>, currency: Currency) -> Self {
        Self {
            store,
            broker,
            currency,
        }
    }

    /// Rebuild every daily snapshot from the earliest trade to today. Idempotent
    /// per date: the last write wins under upsert.
    pub async fn backfill(&self) -> Result<(), SentinelError> {
        let trades = self.store.trades_chronological().await?;
        if trades.is_empty() {
            info!("no trades found, skipping snapshot backfill");
            return Ok(());
        }

        // Only actual stock positions take part; FX pairs, options and other
        // derivatives are filtered out before reconstruction.
        let stock_trades: Vec<_> = trades
            .into_iter()
            .filter(|trade| trade.symbol.is_stock())
            .collect();
        if stock_trades.is_empty() {
            info!("no stock trades found, skipping snapshot backfill");
            return Ok(());
        }

        let symbols: Vec<Symbol> = stock_trades
            .iter()
            .map(|trade| trade.symbol.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        // Load price history; backfill missing symbols from the broker.
        let mut all_prices = self.store.prices_bulk(&symbols, None, None).await?;
        let missing: Vec<Symbol> = symbols
            .iter()
            .filter(|symbol| all_prices.get(*symbol).is_none_or(Vec::is_empty))
            .cloned()
            .collect();
        if !missing.is_empty() {
            info!(symbols = missing.len(), "fetching missing price history");
            let fetched = self.broker.get_historical_prices_bulk(&missing, 3).await?;
            for (symbol, bars) in fetched {
                if !bars.is_empty() {
                    self.store.save_prices(&symbol, &bars).await?;
                    all_prices.insert(symbol, bars);
                }
            }
        }

        let validator = PriceValidator::new();
        let mut price_lookup: HashMap<Symbol, Vec<(NaiveDate, f64)>> = HashMap::new();
        for (symbol, bars) in &all_prices {
            let mut ascending = bars.clone();
            ascending.reverse();
            price_lookup.insert(symbol.clone(), validator.close_lookup(&ascending));
        }

        let securities = self.store.securities(false).await?;
        let mut currency_map: HashMap<Symbol, Ccy> = securities
            .into_iter()
            .map(|security| (security.symbol, security.currency))
            .collect();
        for symbol in &symbols {
            currency_map
                .entry(symbol.clone())
                .or_insert_with(|| currency_from_suffix(symbol));
        }

        let start_date = stock_trades[0].executed_at.date_naive();
        let end_date = Utc::now().date_naive();
        let mut all_dates = Vec::new();
        let mut current = start_date;
        while current <= end_date {
            all_dates.push(current);
            current = current + Days::new(1);
        }

        let currencies: Vec<Ccy> = currency_map
            .values()
            .cloned()
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        info!(
            dates = all_dates.len(),
            currencies = currencies.len(),
            "prefetching FX rates for snapshot backfill"
        );
        self.currency.prefetch(&currencies, &all_dates).await;

        // Walk days with a single pass over the chronological trades.
        let mut positions: HashMap<Symbol, f64> = HashMap::new();
        let mut cost_basis: HashMap<Symbol, f64> = HashMap::new();
        let mut trade_index = 0;

        for date in all_dates {
            while trade_index < stock_trades.len()
                && stock_trades[trade_index].executed_at.date_naive() <= date
            {
                let trade = &stock_trades[trade_index];
                trade_index += 1;

                let symbol = trade.symbol.clone();
                let trade_date = trade.executed_at.date_naive();
                let ccy = currency_map
                    .get(&symbol)
                    .cloned()
                    .unwrap_or(Ccy::EUR);
                let value_eur = self
                    .currency
                    .to_eur_for_date(trade.value_local(), &ccy, trade_date)
                    .await;

                match trade.side {
                    sentinel_instrument::Side::Buy => {
                        *positions.entry(symbol.clone()).or_insert(0.0) += trade.quantity;
                        *cost_basis.entry(symbol).or_insert(0.0) += value_eur;
                    }
                    sentinel_instrument::Side::Sell => {
                        let prev_qty = positions.get(&symbol).copied().unwrap_or(0.0);
                        if prev_qty > 0.0 {
                            let avg_cost_per_unit =
                                cost_basis.get(&symbol).copied().unwrap_or(0.0) / prev_qty;
                            *cost_basis.entry(symbol.clone()).or_insert(0.0) -=
                                trade.quantity * avg_cost_per_unit;
                        }
                        *positions.entry(symbol).or_insert(0.0) -= trade.quantity;
                    }
                }
            }

            let mut positions_value_eur = 0.0;
            let mut snapshot_positions = HashMap::new();
            for (symbol, quantity) in &positions {
                if *quantity <= 0.0 {
                    continue;
                }

                let Some(close) = price_lookup
                    .get(symbol)
                    .and_then(|series| close_at_or_before(series, date))
                else {
                    continue;
                };

                let ccy = currency_map.get(symbol).cloned().unwrap_or(Ccy::EUR);
                let value_eur = self
                    .currency
                    .to_eur_for_date(quantity * close, &ccy, date)
                    .await;
                positions_value_eur += value_eur;
                snapshot_positions.insert(
                    symbol.clone(),
                    SnapshotPosition {
                        quantity: *quantity,
                        value_eur,
                    },
                );
            }

            let total_cost_basis_eur: f64 = positions
                .iter()
                .filter(|(_, quantity)| **quantity > 0.0)
                .map(|(symbol, _)| cost_basis.get(symbol).copied().unwrap_or(0.0))
                .sum();

            self.store
                .upsert_snapshot(&SnapshotRow {
                    date,
                    total_value_eur: positions_value_eur,
                    positions_value_eur,
                    cash_eur: 0.0,
                    net_deposits_eur: total_cost_basis_eur,
                    unrealized_pnl_eur: positions_value_eur - total_cost_basis_eur,
                    positions: snapshot_positions,
                })
                .await?;
        }

        info!("portfolio snapshot backfill complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::date;

    #[test]
    fn test_close_at_or_before() {
        let series = vec![
            (date(2024, 1, 2), 100.0),
            (date(2024, 1, 3), 101.0),
            (date(2024, 1, 5), 103.0),
        ];

        assert_eq!(close_at_or_before(&series, date(2024, 1, 1)), None);
        assert_eq!(close_at_or_before(&series, date(2024, 1, 2)), Some(100.0));
        // Weekend gap resolves to the most recent prior close.
        assert_eq!(close_at_or_before(&series, date(2024, 1, 4)), Some(101.0));
        assert_eq!(close_at_or_before(&series, date(2024, 2, 1)), Some(103.0));
    }

    #[test]
    fn test_currency_from_suffix() {
        assert_eq!(currency_from_suffix(&Symbol::new("AAPL.US")), Ccy::new("USD"));
        assert_eq!(currency_from_suffix(&Symbol::new("0700.AS")), Ccy::new("HKD"));
        assert_eq!(currency_from_suffix(&Symbol::new("ASML.EU")), Ccy::EUR);
    }
}
