use chrono::{DateTime, Utc};
use derive_more::Constructor;
use sentinel_instrument::Symbol;
use serde::{Deserialize, Serialize};

/// One scoring run result for a security. Append-only history; queries resolve the
/// latest row per symbol (optionally as-of a timestamp for backtests).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct ScoreRow {
    pub symbol: Symbol,
    pub score: f64,
    /// Component breakdown document, eg/ {"momentum": 0.4, "rsi": 61.2, ...}.
    pub components: serde_json::Value,
    pub calculated_at: DateTime<Utc>,
}
