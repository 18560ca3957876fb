//! Simulated broker answering quotes from the simulation store.
//!
//! Quotes are validated closes on the simulation date (or the most recent prior
//! date), run through the same corruption correction the production app applies.
//! Orders short-circuit to synthetic ids; account state mirrors the simulation
//! store.

use crate::scoring::price_validator::PriceValidator;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use sentinel_broker::{
    Broker,
    error::BrokerError,
    types::{BrokerCashFlow, BrokerPortfolio, BrokerPosition, BrokerTrade, OrderId, Quote, SecurityInfo},
};
use sentinel_instrument::{Ccy, Symbol, market::PriceBar};
use sentinel_store::{Store, sim::SimulationStore};
use std::{collections::HashMap, sync::Arc};

/// Broker stand-in wired to a [`SimulationStore`].
pub struct SimulatedBroker {
    store: Arc<SimulationStore>,
    validator: PriceValidator,
    /// Validated `(date, close)` series per symbol, ascending, built lazily.
    validated: RwLock<HashMap<Symbol, Vec<(NaiveDate, f64)>>>,
}

impl std::fmt::Debug for SimulatedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBroker").finish_non_exhaustive()
    }
}

impl SimulatedBroker {
    pub fn new(store: Arc<SimulationStore>) -> Self {
        Self {
            store,
            validator: PriceValidator::new(),
            validated: RwLock::new(HashMap::new()),
        }
    }

    /// Close on the simulation date, or the most recent prior close.
    async fn historical_price(&self, symbol: &Symbol) -> Result<Option<f64>, BrokerError> {
        let Some(simulation_date) = self.store.simulation_date() else {
            return Ok(None);
        };

        if !self.validated.read().contains_key(symbol) {
            self.load_and_validate(symbol).await?;
        }

        let validated = self.validated.read();
        let Some(series) = validated.get(symbol) else {
            return Ok(None);
        };
        let idx = series.partition_point(|(date, _)| *date <= simulation_date);
        Ok((idx > 0).then(|| series[idx - 1].1))
    }

    async fn load_and_validate(&self, symbol: &Symbol) -> Result<(), BrokerError> {
        let bars_desc = self
            .store
            .raw_prices(symbol)
            .await
            .map_err(|error| BrokerError::Api(error.to_string()))?;

        let mut ascending = bars_desc;
        ascending.reverse();
        let series = self.validator.close_lookup(&ascending);
        self.validated.write().insert(symbol.clone(), series);
        Ok(())
    }
}

#[async_trait]
impl Broker for SimulatedBroker {
    async fn get_quote(&self, symbol: &Symbol) -> Result<Option<Quote>, BrokerError> {
        let Some(price) = self.historical_price(symbol).await? else {
            return Ok(None);
        };
        Ok(Some(Quote {
            symbol: symbol.clone(),
            price,
            bid: Some(price),
            ask: Some(price),
            change: Some(0.0),
            change_pct: Some(0.0),
        }))
    }

    async fn get_quotes(
        &self,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, Quote>, BrokerError> {
        let mut quotes = HashMap::new();
        for symbol in symbols {
            if let Some(quote) = self.get_quote(symbol).await? {
                quotes.insert(symbol.clone(), quote);
            }
        }
        Ok(quotes)
    }

    async fn get_historical_prices_bulk(
        &self,
        symbols: &[Symbol],
        _years: u32,
    ) -> Result<HashMap<Symbol, Vec<PriceBar>>, BrokerError> {
        self.store
            .prices_bulk(symbols, None, None)
            .await
            .map_err(|error| BrokerError::Api(error.to_string()))
    }

    async fn get_portfolio(&self) -> Result<BrokerPortfolio, BrokerError> {
        let positions = self
            .store
            .positions()
            .await
            .map_err(|error| BrokerError::Api(error.to_string()))?;
        let cash = self
            .store
            .cash_balances()
            .await
            .map_err(|error| BrokerError::Api(error.to_string()))?;

        let mut out = Vec::with_capacity(positions.len());
        for position in positions {
            let current_price = match self.historical_price(&position.symbol).await? {
                Some(price) => Some(price),
                None => position.current_price,
            };
            out.push(BrokerPosition {
                symbol: position.symbol,
                quantity: position.quantity,
                avg_cost: position.avg_cost,
                current_price,
                currency: position.currency,
                name: None,
            });
        }

        Ok(BrokerPortfolio {
            positions: out,
            cash,
        })
    }

    async fn buy(
        &self,
        symbol: &Symbol,
        quantity: f64,
        _price: Option<f64>,
    ) -> Result<Option<OrderId>, BrokerError> {
        Ok(Some(OrderId(format!("BACKTEST-BUY-{symbol}-{quantity}"))))
    }

    async fn sell(
        &self,
        symbol: &Symbol,
        quantity: f64,
        _price: Option<f64>,
    ) -> Result<Option<OrderId>, BrokerError> {
        Ok(Some(OrderId(format!("BACKTEST-SELL-{symbol}-{quantity}"))))
    }

    async fn get_trades_history(
        &self,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<BrokerTrade>, BrokerError> {
        Ok(Vec::new())
    }

    async fn get_cash_flows(
        &self,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<BrokerCashFlow>, BrokerError> {
        Ok(Vec::new())
    }

    async fn get_corporate_actions(
        &self,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<serde_json::Value>, BrokerError> {
        Ok(Vec::new())
    }

    async fn get_security_info(
        &self,
        _symbol: &Symbol,
    ) -> Result<Option<SecurityInfo>, BrokerError> {
        Ok(None)
    }

    async fn is_market_open(&self, _market_id: &str) -> Result<bool, BrokerError> {
        Ok(true)
    }

    async fn get_available_securities(&self) -> Result<Vec<Symbol>, BrokerError> {
        Ok(Vec::new())
    }

    async fn eur_cross_rates(
        &self,
        _currencies: &[Ccy],
        _date: Option<NaiveDate>,
    ) -> Result<HashMap<Ccy, f64>, BrokerError> {
        // The converter falls back to persisted or default rates.
        Ok(HashMap::new())
    }
}
