use chrono::NaiveDate;
use derive_more::Constructor;
use serde::{Deserialize, Serialize};

/// Daily OHLCV bar for a security, keyed by (symbol, date) in the store.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Deserialize, Serialize, Constructor)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// Construct a bar where every OHLC field carries the same close price.
    ///
    /// Used for interpolated bars and broker feeds that only provide closes.
    pub fn from_close(date: NaiveDate, close: f64) -> Self {
        Self {
            date,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_close() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let bar = PriceBar::from_close(date, 101.5);
        assert_eq!(bar.open, 101.5);
        assert_eq!(bar.high, 101.5);
        assert_eq!(bar.low, 101.5);
        assert_eq!(bar.close, 101.5);
        assert_eq!(bar.volume, 0.0);
    }
}
