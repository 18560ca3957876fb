//! Statistical algorithms shared by the backtest summary, scoring and analytics.

/// Arithmetic mean; empty input yields 0.0.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; fewer than two values yields 0.0.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean(values);
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Simple period-over-period returns of an equity curve.
pub fn daily_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Largest peak-to-trough decline of an equity curve, as a positive fraction.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let Some(&first) = values.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut max_dd: f64 = 0.0;
    for &value in values {
        peak = peak.max(value);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - value) / peak);
        }
    }
    max_dd
}

/// Annualised Sharpe ratio of daily returns: `sqrt(252) * mean / std_dev`.
///
/// Degenerate inputs (fewer than two returns, zero dispersion) yield 0.0.
pub fn sharpe_ratio(daily_returns: &[f64]) -> f64 {
    if daily_returns.len() < 2 {
        return 0.0;
    }
    let vol = std_dev(daily_returns);
    if vol <= 1e-12 {
        return 0.0;
    }
    (mean(daily_returns) / vol) * 252_f64.sqrt()
}

/// Compound annual growth rate over `years`, comparing final value to deposits.
/// Returned as a fraction (0.07 = 7% p.a.); degenerate inputs yield 0.0.
pub fn cagr(final_value: f64, total_deposits: f64, years: f64) -> f64 {
    if years <= 0.0 || total_deposits <= 0.0 || final_value <= 0.0 {
        return 0.0;
    }
    (final_value / total_deposits).powf(1.0 / years) - 1.0
}

/// Annualise a holding-period return over `days_held` days.
pub fn annualized_return(profit_pct: f64, days_held: i64) -> f64 {
    if days_held <= 0 {
        return profit_pct;
    }
    let base = 1.0 + profit_pct;
    if base <= 0.0 {
        return -1.0;
    }
    base.powf(365.25 / days_held as f64) - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_and_std_dev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(mean(&values), 5.0);
        assert_relative_eq!(std_dev(&values), 2.0);
    }

    #[test]
    fn test_max_drawdown() {
        struct TestCase {
            input: Vec<f64>,
            expected: f64,
        }

        let cases = vec![
            TestCase {
                input: vec![],
                expected: 0.0,
            },
            TestCase {
                input: vec![100.0, 110.0, 120.0],
                expected: 0.0,
            },
            TestCase {
                input: vec![100.0, 80.0, 120.0, 90.0],
                expected: 0.25,
            },
            TestCase {
                input: vec![100.0, 110.0, 55.0, 100.0],
                expected: 0.5,
            },
        ];

        for test in &cases {
            assert_relative_eq!(max_drawdown(&test.input), test.expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_sharpe_ratio_zero_for_degenerate_inputs() {
        assert_eq!(sharpe_ratio(&[]), 0.0);
        assert_eq!(sharpe_ratio(&[0.01]), 0.0);
        assert_eq!(sharpe_ratio(&[0.01, 0.01, 0.01]), 0.0);
    }

    #[test]
    fn test_sharpe_ratio_scales_by_sqrt_252() {
        let returns = [0.01, -0.01, 0.02, 0.0, 0.01];
        let expected = mean(&returns) / std_dev(&returns) * 252_f64.sqrt();
        assert_relative_eq!(sharpe_ratio(&returns), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_cagr() {
        assert_relative_eq!(cagr(2000.0, 1000.0, 1.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(cagr(1210.0, 1000.0, 2.0), 0.1, epsilon = 1e-12);
        assert_eq!(cagr(1000.0, 0.0, 1.0), 0.0);
        assert_eq!(cagr(1000.0, 1000.0, 0.0), 0.0);
    }

    #[test]
    fn test_annualized_return() {
        assert_relative_eq!(annualized_return(0.10, 365), 0.10, epsilon = 0.01);
        assert!(annualized_return(0.10, 180) > 0.19);
        assert_eq!(annualized_return(0.10, 0), 0.10);
    }
}
