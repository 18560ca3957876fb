//! Detection and correction of corrupted price data.
//!
//! Broker feeds occasionally deliver closes that are off by orders of magnitude
//! (decimal-point shifts, currency mixups). Corrupted bars are detected against a
//! rolling median and repaired by linear interpolation between the nearest valid
//! neighbours. The same detector gates live trades: a quote that deviates wildly
//! from recent history blocks the trade instead of being acted on.

use chrono::NaiveDate;
use sentinel_instrument::market::PriceBar;
use tracing::debug;

/// A close further than this factor from the rolling median is corrupted.
const CORRUPTION_FACTOR: f64 = 5.0;
/// A live price further than this factor from the recent median blocks trading.
const TRADE_BLOCK_FACTOR: f64 = 3.0;
/// Rolling window used for both checks.
const MEDIAN_WINDOW: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct PriceValidator;

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    Some(values[values.len() / 2])
}

impl PriceValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate an ascending (oldest-first) series, replacing corrupted closes by
    /// interpolation between the nearest valid neighbours. Bars with non-positive
    /// closes are treated as corrupted too.
    pub fn validate_and_interpolate(&self, bars: &[PriceBar]) -> Vec<PriceBar> {
        if bars.len() < 3 {
            return bars.to_vec();
        }

        let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
        let mut valid = vec![true; bars.len()];

        for index in 0..bars.len() {
            let close = closes[index];
            if close <= 0.0 {
                valid[index] = false;
                continue;
            }

            let window_start = index.saturating_sub(MEDIAN_WINDOW);
            let mut window: Vec<f64> = closes[window_start..index]
                .iter()
                .chain(closes[(index + 1)..bars.len().min(index + 1 + MEDIAN_WINDOW)].iter())
                .copied()
                .filter(|value| *value > 0.0)
                .collect();

            if let Some(median) = median(&mut window) {
                if close > median * CORRUPTION_FACTOR || close < median / CORRUPTION_FACTOR {
                    valid[index] = false;
                }
            }
        }

        let mut out = bars.to_vec();
        for index in 0..out.len() {
            if valid[index] {
                continue;
            }

            let prev = (0..index).rev().find(|i| valid[*i]);
            let next = ((index + 1)..out.len()).find(|i| valid[*i]);

            let repaired = match (prev, next) {
                (Some(prev), Some(next)) => {
                    let span = (next - prev) as f64;
                    let t = (index - prev) as f64 / span;
                    closes[prev] + (closes[next] - closes[prev]) * t
                }
                (Some(prev), None) => closes[prev],
                (None, Some(next)) => closes[next],
                (None, None) => continue,
            };

            debug!(
                date = %out[index].date,
                from = closes[index],
                to = repaired,
                "interpolated corrupted close"
            );
            out[index] = PriceBar::from_close(out[index].date, repaired);
        }

        out
    }

    /// Convenience wrapper for newest-first series (the store's native order).
    /// Returns the validated series newest-first.
    pub fn validate_series_desc(&self, bars: &[PriceBar]) -> Vec<PriceBar> {
        let mut ascending: Vec<PriceBar> = bars.to_vec();
        ascending.reverse();
        let mut validated = self.validate_and_interpolate(&ascending);
        validated.reverse();
        validated
    }

    /// Validated `date -> close` lookup from an ascending series.
    pub fn close_lookup(&self, bars: &[PriceBar]) -> Vec<(NaiveDate, f64)> {
        self.validate_and_interpolate(bars)
            .into_iter()
            .filter(|bar| bar.close > 0.0)
            .map(|bar| (bar.date, bar.close))
            .collect()
    }
}

/// Decide whether a live price is safe to trade against, given recent historical
/// closes (ascending). Returns `(allow, reason)`.
pub fn check_trade_blocking(price: f64, historical_closes: &[f64], symbol: &str) -> (bool, String) {
    if price <= 0.0 {
        return (false, format!("{symbol}: non-positive price"));
    }

    let mut window: Vec<f64> = historical_closes
        .iter()
        .rev()
        .take(MEDIAN_WINDOW)
        .copied()
        .filter(|value| *value > 0.0)
        .collect();

    let Some(median) = median(&mut window) else {
        return (true, String::new());
    };

    if price > median * TRADE_BLOCK_FACTOR || price < median / TRADE_BLOCK_FACTOR {
        return (
            false,
            format!(
                "{symbol}: price {price:.4} deviates from recent median {median:.4}, trading blocked"
            ),
        );
    }
    (true, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{date, flat_bars};

    #[test]
    fn test_clean_series_is_untouched() {
        let bars = flat_bars(date(2024, 6, 28), 30, 100.0);
        let validated = PriceValidator::new().validate_and_interpolate(&bars);
        assert_eq!(validated, bars);
    }

    #[test]
    fn test_spike_is_interpolated() {
        let mut bars = flat_bars(date(2024, 6, 28), 30, 100.0);
        bars[15].close = 10_000.0; // decimal-shift corruption

        let validated = PriceValidator::new().validate_and_interpolate(&bars);
        assert!((validated[15].close - 100.0).abs() < 1.0);
    }

    #[test]
    fn test_zero_close_is_interpolated() {
        let mut bars = flat_bars(date(2024, 6, 28), 10, 50.0);
        bars[4].close = 0.0;

        let validated = PriceValidator::new().validate_and_interpolate(&bars);
        assert!((validated[4].close - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_trade_blocking() {
        let history: Vec<f64> = vec![100.0; 30];

        let (allow, reason) = check_trade_blocking(101.0, &history, "AAPL.US");
        assert!(allow);
        assert!(reason.is_empty());

        let (allow, reason) = check_trade_blocking(1_000.0, &history, "AAPL.US");
        assert!(!allow);
        assert!(reason.contains("AAPL.US"));

        let (allow, _) = check_trade_blocking(10.0, &history, "AAPL.US");
        assert!(!allow);
    }

    #[test]
    fn test_trade_blocking_without_history_allows() {
        let (allow, _) = check_trade_blocking(100.0, &[], "AAPL.US");
        assert!(allow);
    }
}
