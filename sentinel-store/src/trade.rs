use chrono::{DateTime, Utc};
use derive_more::Constructor;
use sentinel_instrument::{Ccy, Side, Symbol};
use serde::{Deserialize, Serialize};

/// An executed trade mirrored from the broker (or synthesised by the backtester).
///
/// Append-only; rows are never mutated and duplicate `broker_trade_id`s are dropped
/// silently on insert.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct TradeRecord {
    pub broker_trade_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub commission_currency: Ccy,
    pub executed_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

impl TradeRecord {
    pub fn value_local(&self) -> f64 {
        self.quantity * self.price
    }
}
