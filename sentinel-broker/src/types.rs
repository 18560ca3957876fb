use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Constructor;
use sentinel_instrument::{Ccy, Side, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Live quote for one symbol.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Quote {
    pub symbol: Symbol,
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
}

/// Position row from the broker's account summary.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    pub quantity: f64,
    pub avg_cost: Option<f64>,
    pub current_price: Option<f64>,
    pub currency: Ccy,
    pub name: Option<String>,
}

/// Portfolio state mirrored from the broker: positions plus per-currency cash.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct BrokerPortfolio {
    pub positions: Vec<BrokerPosition>,
    pub cash: HashMap<Ccy, f64>,
}

/// Executed trade row from the broker history endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BrokerTrade {
    pub trade_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub commission_currency: Ccy,
    pub executed_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Cash movement row from the broker statement. `type_id` is the broker's raw
/// category ("card", "card_payout", "dividend", "tax", "block", "unblock").
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BrokerCashFlow {
    pub date: NaiveDate,
    pub type_id: String,
    pub amount: f64,
    pub currency: Ccy,
    pub comment: Option<String>,
    pub raw: serde_json::Value,
}

/// Security metadata from the broker's instrument endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SecurityInfo {
    pub symbol: Symbol,
    pub name: String,
    pub currency: Ccy,
    pub market_id: Option<String>,
    pub min_lot: u32,
}

/// Broker order id - synthetic in research mode, real in live mode.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    Constructor,
)]
pub struct OrderId(pub String);
