use chrono::{DateTime, Utc};
use sentinel_instrument::{Ccy, Symbol};
use serde::{Deserialize, Serialize};

/// Parse a comma-separated tag field into stripped, non-empty values.
pub fn parse_csv_field(value: Option<&str>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// A security in the tradeable universe.
///
/// `geography` and `industry` are comma-separated tag sets; multi-tag securities split
/// their allocation weight equally across tags.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Security {
    pub symbol: Symbol,
    pub name: String,
    pub currency: Ccy,
    pub geography: Option<String>,
    pub industry: Option<String>,
    pub market_id: Option<String>,
    pub min_lot: u32,
    pub active: bool,
    pub allow_buy: bool,
    pub allow_sell: bool,
    /// User conviction multiplier: 1.0 neutral, > 1 bullish boost, < 1 bearish damp,
    /// 0 excludes the security from the ideal portfolio entirely.
    pub user_multiplier: f64,
    pub first_bought_at: Option<DateTime<Utc>>,
    pub last_sold_at: Option<DateTime<Utc>>,
}

impl Security {
    /// Minimal active security with defaults for everything but identity.
    pub fn new(symbol: Symbol, name: impl Into<String>, currency: Ccy) -> Self {
        Self {
            symbol,
            name: name.into(),
            currency,
            geography: None,
            industry: None,
            market_id: None,
            min_lot: 1,
            active: true,
            allow_buy: true,
            allow_sell: true,
            user_multiplier: 1.0,
            first_bought_at: None,
            last_sold_at: None,
        }
    }

    pub fn geographies(&self) -> Vec<String> {
        parse_csv_field(self.geography.as_deref())
    }

    pub fn industries(&self) -> Vec<String> {
        parse_csv_field(self.industry.as_deref())
    }

    /// Most recent of first-bought / last-sold, used by hold-time and cooldown gates.
    pub fn last_transaction_at(&self) -> Option<DateTime<Utc>> {
        match (self.first_bought_at, self.last_sold_at) {
            (Some(bought), Some(sold)) => Some(bought.max(sold)),
            (Some(bought), None) => Some(bought),
            (None, Some(sold)) => Some(sold),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_field() {
        assert_eq!(
            parse_csv_field(Some("US, Europe ,,Asia")),
            vec!["US", "Europe", "Asia"]
        );
        assert!(parse_csv_field(Some("")).is_empty());
        assert!(parse_csv_field(None).is_empty());
    }

    #[test]
    fn test_last_transaction_at_takes_max() {
        let mut security = Security::new(Symbol::new("AAPL.US"), "Apple", Ccy::new("USD"));
        assert_eq!(security.last_transaction_at(), None);

        let bought = DateTime::<Utc>::MIN_UTC;
        let sold = bought + chrono::TimeDelta::days(10);

        security.first_bought_at = Some(bought);
        assert_eq!(security.last_transaction_at(), Some(bought));

        security.last_sold_at = Some(sold);
        assert_eq!(security.last_transaction_at(), Some(sold));
    }
}
