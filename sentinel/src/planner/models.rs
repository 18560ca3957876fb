use sentinel_instrument::{Ccy, Side, Symbol};
use serde::{Deserialize, Serialize};

/// Priority assigned to solvency-driven deficit sells, ahead of any score-driven
/// recommendation.
pub const DEFICIT_SELL_PRIORITY: f64 = 1000.0;

/// One trade the Planner recommends to converge toward the ideal allocation.
///
/// Transient: recommendations are derived on demand (and briefly cached), never
/// persisted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TradeRecommendation {
    pub symbol: Symbol,
    pub action: Side,
    pub current_allocation: f64,
    pub target_allocation: f64,
    pub allocation_delta: f64,
    pub current_value_eur: f64,
    pub target_value_eur: f64,
    /// Positive for buys, negative for sells.
    pub value_delta_eur: f64,
    pub quantity: f64,
    pub price: f64,
    pub currency: Ccy,
    pub lot_size: u32,
    pub expected_return: f64,
    pub priority: f64,
    pub reason: String,
    /// Logical allocation compartment; informational only.
    pub sleeve: String,
}

impl TradeRecommendation {
    pub fn is_buy(&self) -> bool {
        self.action == Side::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.action == Side::Sell
    }
}
