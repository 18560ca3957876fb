use chrono::NaiveDate;
use sentinel_instrument::Symbol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-symbol entry inside a daily snapshot document.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct SnapshotPosition {
    pub quantity: f64,
    pub value_eur: f64,
}

/// Daily portfolio snapshot keyed by date (UTC midnight). Reconstruction is
/// idempotent per date: the last write wins under upsert.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SnapshotRow {
    pub date: NaiveDate,
    pub total_value_eur: f64,
    pub positions_value_eur: f64,
    pub cash_eur: f64,
    pub net_deposits_eur: f64,
    pub unrealized_pnl_eur: f64,
    pub positions: HashMap<Symbol, SnapshotPosition>,
}
