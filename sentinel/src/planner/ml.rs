//! External ML scoring service client.
//!
//! One GET against the scoring service; on ANY error (connectivity, status, shape)
//! the caller continues with wavelet-only scores. This fallback is a robustness
//! contract, not a silent failure - hence the warn-level log.

use chrono::{DateTime, Utc};
use sentinel_instrument::Symbol;
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetch blended ML scores for the given symbols. `None` on any failure.
pub async fn fetch_scores(
    base_url: &str,
    symbols: &[Symbol],
    as_of: Option<DateTime<Utc>>,
) -> Option<HashMap<Symbol, f64>> {
    if symbols.is_empty() {
        return Some(HashMap::new());
    }

    let joined = symbols
        .iter()
        .map(Symbol::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let mut query: Vec<(&str, String)> = vec![("symbols", joined)];
    if let Some(as_of) = as_of {
        query.push(("as_of_ts", as_of.timestamp().to_string()));
    }

    let url = format!("{}/ml/latest-scores", base_url.trim_end_matches('/'));
    let payload: Value = match async {
        reqwest::Client::new()
            .get(&url)
            .query(&query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
    .await
    {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, "ML score fetch failed, continuing with wavelet-only scores");
            return None;
        }
    };

    let scores = payload.get("scores")?.as_object()?;
    let mut result = HashMap::new();
    for (symbol, entry) in scores {
        let value = entry
            .get("final_score")
            .or_else(|| entry.get("ml_score"))
            .and_then(Value::as_f64);
        if let Some(value) = value {
            result.insert(Symbol::new(symbol.as_str()), value);
        }
    }
    Some(result)
}
