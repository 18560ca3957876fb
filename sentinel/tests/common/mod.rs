//! Shared test harness: a scripted mock broker plus store seeding helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use parking_lot::Mutex;
use sentinel::AppContext;
use sentinel_broker::{
    Broker,
    error::BrokerError,
    types::{
        BrokerCashFlow, BrokerPortfolio, BrokerTrade, OrderId, Quote, SecurityInfo,
    },
};
use sentinel_instrument::{Ccy, Side, Symbol, market::PriceBar};
use sentinel_store::{
    Store, security::Security, sqlite::SqliteStore, trade::TradeRecord,
};
use std::{collections::HashMap, sync::Arc};
use tempfile::TempDir;

/// One order submitted through the mock broker.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedOrder {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub price: Option<f64>,
}

/// Scripted broker double: answers from configured fixtures and records orders.
#[derive(Debug, Default)]
pub struct MockBroker {
    pub quotes: Mutex<HashMap<Symbol, Quote>>,
    pub portfolio: Mutex<BrokerPortfolio>,
    pub historical: Mutex<HashMap<Symbol, Vec<PriceBar>>>,
    /// Raw EUR cross rates: 1 EUR = X ccy.
    pub rates: Mutex<HashMap<Ccy, f64>>,
    pub market_open: Mutex<bool>,
    pub orders: Mutex<Vec<SubmittedOrder>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quote(&self, symbol: &str, price: f64) {
        self.quotes.lock().insert(
            Symbol::new(symbol),
            Quote {
                symbol: Symbol::new(symbol),
                price,
                bid: Some(price),
                ask: Some(price),
                change: Some(0.0),
                change_pct: Some(0.0),
            },
        );
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_quote(&self, symbol: &Symbol) -> Result<Option<Quote>, BrokerError> {
        Ok(self.quotes.lock().get(symbol).cloned())
    }

    async fn get_quotes(
        &self,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, Quote>, BrokerError> {
        let quotes = self.quotes.lock();
        Ok(symbols
            .iter()
            .filter_map(|symbol| quotes.get(symbol).map(|q| (symbol.clone(), q.clone())))
            .collect())
    }

    async fn get_historical_prices_bulk(
        &self,
        symbols: &[Symbol],
        _years: u32,
    ) -> Result<HashMap<Symbol, Vec<PriceBar>>, BrokerError> {
        let historical = self.historical.lock();
        Ok(symbols
            .iter()
            .filter_map(|symbol| {
                historical
                    .get(symbol)
                    .map(|bars| (symbol.clone(), bars.clone()))
            })
            .collect())
    }

    async fn get_portfolio(&self) -> Result<BrokerPortfolio, BrokerError> {
        Ok(self.portfolio.lock().clone())
    }

    async fn buy(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Option<OrderId>, BrokerError> {
        self.orders.lock().push(SubmittedOrder {
            symbol: symbol.clone(),
            side: Side::Buy,
            quantity,
            price,
        });
        Ok(Some(OrderId(format!("MOCK-BUY-{symbol}-{quantity}"))))
    }

    async fn sell(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Option<OrderId>, BrokerError> {
        self.orders.lock().push(SubmittedOrder {
            symbol: symbol.clone(),
            side: Side::Sell,
            quantity,
            price,
        });
        Ok(Some(OrderId(format!("MOCK-SELL-{symbol}-{quantity}"))))
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
        Ok(*self.market_open.lock())
    }

    async fn get_available_securities(&self) -> Result<Vec<Symbol>, BrokerError> {
        Ok(Vec::new())
    }

    async fn eur_cross_rates(
        &self,
        currencies: &[Ccy],
        _date: Option<NaiveDate>,
    ) -> Result<HashMap<Ccy, f64>, BrokerError> {
        let rates = self.rates.lock();
        Ok(currencies
            .iter()
            .filter_map(|currency| rates.get(currency).map(|rate| (currency.clone(), *rate)))
            .collect())
    }
}

/// Fresh file-backed store inside the given temp dir.
pub async fn store_in(dir: &TempDir) -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::connect(&dir.path().join("sentinel.db"))
            .await
            .expect("store connects"),
    )
}

/// Wire an [`AppContext`] over the given store and broker.
pub fn context(store: Arc<SqliteStore>, broker: Arc<MockBroker>) -> AppContext {
    AppContext::new(store as Arc<dyn Store>, broker as Arc<dyn Broker>, None)
}

/// Active EUR security with the given lot size.
pub fn security(symbol: &str, min_lot: u32) -> Security {
    let mut security = Security::new(Symbol::new(symbol), symbol, Ccy::EUR);
    security.min_lot = min_lot;
    security
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn days_ago(days: u64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(days as i64)
}

/// Daily bars from `start`, drifting linearly from `start_price` by `step` per day.
pub fn trending_bars(start: NaiveDate, len: usize, start_price: f64, step: f64) -> Vec<PriceBar> {
    (0..len)
        .map(|offset| {
            PriceBar::from_close(
                start + Days::new(offset as u64),
                start_price + step * offset as f64,
            )
        })
        .collect()
}

/// Minimal trade row for cooldown and idempotence tests.
pub fn trade(
    broker_trade_id: &str,
    symbol: &str,
    side: Side,
    quantity: f64,
    price: f64,
    executed_at: DateTime<Utc>,
) -> TradeRecord {
    TradeRecord {
        broker_trade_id: broker_trade_id.to_string(),
        symbol: Symbol::new(symbol),
        side,
        quantity,
        price,
        commission: 0.0,
        commission_currency: Ccy::EUR,
        executed_at,
        raw: serde_json::Value::Null,
    }
}
