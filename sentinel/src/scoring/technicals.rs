//! Technical indicators and the composite security score.
//!
//! The scoring job condenses recent price action into a scalar in [-1, 1] plus a
//! component breakdown document. The Planner treats this as the security's expected
//! return when no external ML score is available.

use crate::statistic;
use sentinel_instrument::market::PriceBar;
use serde::{Deserialize, Serialize};
use serde_json::json;

const RSI_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_WIDTH: f64 = 2.0;
const MA_LONG_PERIOD: usize = 200;
const VOLATILITY_WINDOW: usize = 20;

/// Indicator bundle consumed by the sell scorer's instability component.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct TechnicalData {
    /// Recent-window annualised volatility.
    pub current_volatility: f64,
    /// Full-series annualised volatility.
    pub historical_volatility: f64,
    /// Fractional distance of the last close from the 200-day moving average.
    pub distance_from_ma_200: f64,
}

/// Relative Strength Index over the final `period` bars of an ascending close
/// series. Returns 50 (neutral) when there is insufficient data.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() <= period {
        return 50.0;
    }

    let deltas: Vec<f64> = closes[closes.len() - period - 1..]
        .windows(2)
        .map(|w| w[1] - w[0])
        .collect();

    let gains: f64 = deltas.iter().filter(|d| **d > 0.0).sum();
    let losses: f64 = -deltas.iter().filter(|d| **d < 0.0).sum::<f64>();

    if losses == 0.0 {
        return 100.0;
    }
    let rs = (gains / period as f64) / (losses / period as f64);
    100.0 - 100.0 / (1.0 + rs)
}

/// Bollinger %B of the last close: 0 at the lower band, 1 at the upper band.
/// Returns 0.5 (neutral) when there is insufficient data or zero dispersion.
pub fn bollinger_percent_b(closes: &[f64], period: usize, width: f64) -> f64 {
    if closes.len() < period {
        return 0.5;
    }
    let window = &closes[closes.len() - period..];
    let mean = statistic::mean(window);
    let std = statistic::std_dev(window);
    if std <= 1e-12 {
        return 0.5;
    }
    let last = closes[closes.len() - 1];
    let lower = mean - width * std;
    let upper = mean + width * std;
    (last - lower) / (upper - lower)
}

/// Annualised volatility of the final `window` daily returns.
pub fn annualized_volatility(closes: &[f64], window: usize) -> f64 {
    let returns = statistic::daily_returns(closes);
    if returns.is_empty() {
        return 0.0;
    }
    let start = returns.len().saturating_sub(window);
    statistic::std_dev(&returns[start..]) * 252_f64.sqrt()
}

/// Simple return over the final `days` bars; 0.0 with insufficient data.
pub fn momentum(closes: &[f64], days: usize) -> f64 {
    if closes.len() <= days {
        return 0.0;
    }
    let past = closes[closes.len() - 1 - days];
    if past <= 0.0 {
        return 0.0;
    }
    closes[closes.len() - 1] / past - 1.0
}

/// Indicator bundle for the instability component, from an ascending series.
pub fn technical_data(bars: &[PriceBar]) -> Option<TechnicalData> {
    if bars.len() < VOLATILITY_WINDOW + 1 {
        return None;
    }
    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();

    let current = annualized_volatility(&closes, VOLATILITY_WINDOW);
    let historical = annualized_volatility(&closes, closes.len());

    let ma_window = closes.len().min(MA_LONG_PERIOD);
    let ma = statistic::mean(&closes[closes.len() - ma_window..]);
    let distance = if ma > 0.0 {
        closes[closes.len() - 1] / ma - 1.0
    } else {
        0.0
    };

    Some(TechnicalData {
        current_volatility: current,
        historical_volatility: historical,
        distance_from_ma_200: distance,
    })
}

/// Composite score in [-1, 1] plus its component document.
///
/// Momentum carries the bulk of the signal; RSI and Bollinger %B contribute
/// mean-reversion tilts, and a Sharpe term rewards steady compounders.
pub fn composite_score(bars: &[PriceBar]) -> Option<(f64, serde_json::Value)> {
    if bars.len() < BOLLINGER_PERIOD + 1 {
        return None;
    }
    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();

    let momentum_1y = momentum(&closes, closes.len().min(252).saturating_sub(1));
    let rsi_value = rsi(&closes, RSI_PERIOD);
    let percent_b = bollinger_percent_b(&closes, BOLLINGER_PERIOD, BOLLINGER_WIDTH);
    let sharpe = statistic::sharpe_ratio(&statistic::daily_returns(&closes));

    // Oversold (low RSI, low %B) tilts positive; stretched tilts negative.
    let rsi_signal = (50.0 - rsi_value) / 50.0;
    let bollinger_signal = (0.5 - percent_b).clamp(-0.5, 0.5);
    let sharpe_signal = (sharpe / 3.0).clamp(-1.0, 1.0);
    let momentum_signal = momentum_1y.clamp(-1.0, 1.0);

    let score = (0.50 * momentum_signal
        + 0.15 * rsi_signal
        + 0.15 * bollinger_signal
        + 0.20 * sharpe_signal)
        .clamp(-1.0, 1.0);

    let components = json!({
        "momentum_1y": momentum_1y,
        "rsi": rsi_value,
        "bollinger_percent_b": percent_b,
        "sharpe": sharpe,
    });

    Some((score, components))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{date, flat_bars};

    fn trending_closes(len: usize, start: f64, step: f64) -> Vec<f64> {
        (0..len).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn test_rsi_bounds() {
        let rising = trending_closes(30, 100.0, 1.0);
        assert_eq!(rsi(&rising, RSI_PERIOD), 100.0);

        let falling = trending_closes(30, 100.0, -1.0);
        assert!(rsi(&falling, RSI_PERIOD) < 1.0);

        assert_eq!(rsi(&[100.0, 101.0], RSI_PERIOD), 50.0);
    }

    #[test]
    fn test_bollinger_percent_b_neutral_cases() {
        assert_eq!(bollinger_percent_b(&[100.0; 5], 20, 2.0), 0.5);
        assert_eq!(bollinger_percent_b(&[100.0; 40], 20, 2.0), 0.5);
    }

    #[test]
    fn test_bollinger_percent_b_high_for_stretched_close() {
        let mut closes = trending_closes(40, 100.0, 0.1);
        closes.push(110.0);
        assert!(bollinger_percent_b(&closes, 20, 2.0) > 0.9);
    }

    #[test]
    fn test_momentum() {
        let closes = trending_closes(253, 100.0, 1.0);
        let m = momentum(&closes, 252);
        assert!((m - 2.52).abs() < 0.01);
        assert_eq!(momentum(&closes[..10], 252), 0.0);
    }

    #[test]
    fn test_technical_data_requires_history() {
        let bars = flat_bars(date(2024, 6, 28), 10, 100.0);
        assert!(technical_data(&bars).is_none());

        let bars = flat_bars(date(2024, 6, 28), 260, 100.0);
        let data = technical_data(&bars).unwrap();
        assert_eq!(data.current_volatility, 0.0);
        assert!(data.distance_from_ma_200.abs() < 1e-9);
    }

    #[test]
    fn test_composite_score_bounds() {
        let closes = trending_closes(260, 50.0, 0.5);
        let bars: Vec<_> = closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                sentinel_instrument::market::PriceBar::from_close(
                    date(2023, 1, 1) + chrono::Days::new(i as u64),
                    *close,
                )
            })
            .collect();

        let (score, components) = composite_score(&bars).unwrap();
        assert!((-1.0..=1.0).contains(&score));
        assert!(score > 0.0, "steady uptrend should score positive");
        assert!(components.get("rsi").is_some());
    }
}
