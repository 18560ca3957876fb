use chrono::{DateTime, Utc};
use derive_more::Constructor;
use sentinel_instrument::{Ccy, Symbol};
use serde::{Deserialize, Serialize};

/// A held position. A row exists iff a non-zero holding has ever been seen;
/// `quantity <= 0` hides the row from active-positions queries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: f64,
    /// Average cost per unit in the position's local currency.
    pub avg_cost: Option<f64>,
    pub current_price: Option<f64>,
    pub currency: Ccy,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn price(&self) -> f64 {
        self.current_price.unwrap_or(0.0)
    }

    pub fn value_local(&self) -> f64 {
        self.quantity * self.price()
    }
}

/// Partial position update - `None` fields keep their stored value.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, Constructor)]
pub struct PositionUpdate {
    pub symbol: Symbol,
    pub quantity: Option<f64>,
    pub avg_cost: Option<f64>,
    pub current_price: Option<f64>,
    pub currency: Option<Ccy>,
}

impl PositionUpdate {
    pub fn price_only(symbol: Symbol, current_price: f64) -> Self {
        Self {
            symbol,
            current_price: Some(current_price),
            ..Default::default()
        }
    }
}
