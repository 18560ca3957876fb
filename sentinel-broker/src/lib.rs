#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Sentinel-Broker
//! Tradernet REST adapter behind the [`Broker`] seam: quotes, historical bars,
//! account mirroring, order submission with a research-mode short circuit, cash
//! flow statements, market status, and EUR cross rates.
//!
//! The backtester provides its own [`Broker`] implementation that answers quotes
//! from a simulation store, which is why every consumer holds a `dyn Broker`.

use async_trait::async_trait;
use chrono::NaiveDate;
use sentinel_instrument::{Ccy, Symbol, market::PriceBar};
use std::collections::HashMap;

use crate::{
    error::BrokerError,
    types::{
        BrokerCashFlow, BrokerPortfolio, BrokerTrade, OrderId, Quote, SecurityInfo,
    },
};

pub mod error;
pub mod fx;
pub mod tradernet;
pub mod types;

pub use tradernet::Tradernet;

/// Order submission mode. Research mode short-circuits to a synthetic order id and
/// produces no side effects at the broker.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Research,
    Live,
}

impl TradingMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "live" => Self::Live,
            _ => Self::Research,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

/// The outbound broker seam.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_quote(&self, symbol: &Symbol) -> Result<Option<Quote>, BrokerError>;

    /// Batch quotes. Implementations cache results for 5 minutes.
    async fn get_quotes(
        &self,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, Quote>, BrokerError>;

    async fn get_historical_prices_bulk(
        &self,
        symbols: &[Symbol],
        years: u32,
    ) -> Result<HashMap<Symbol, Vec<PriceBar>>, BrokerError>;

    async fn get_portfolio(&self) -> Result<BrokerPortfolio, BrokerError>;

    /// Place a buy order. Asian-market symbols (suffix `.AS`) require a limit price.
    async fn buy(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Option<OrderId>, BrokerError>;

    /// Place a sell order. Asian-market symbols (suffix `.AS`) require a limit price.
    async fn sell(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Option<OrderId>, BrokerError>;

    async fn get_trades_history(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<BrokerTrade>, BrokerError>;

    async fn get_cash_flows(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<BrokerCashFlow>, BrokerError>;

    async fn get_corporate_actions(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<serde_json::Value>, BrokerError>;

    async fn get_security_info(
        &self,
        symbol: &Symbol,
    ) -> Result<Option<SecurityInfo>, BrokerError>;

    async fn is_market_open(&self, market_id: &str) -> Result<bool, BrokerError>;

    /// Top tradeable securities, used to sample a backtest universe.
    async fn get_available_securities(&self) -> Result<Vec<Symbol>, BrokerError>;

    /// Raw EUR cross rates: 1 EUR = X units of each requested currency, optionally
    /// for a historical date. The currency converter inverts these.
    async fn eur_cross_rates(
        &self,
        currencies: &[Ccy],
        date: Option<NaiveDate>,
    ) -> Result<HashMap<Ccy, f64>, BrokerError>;
}
