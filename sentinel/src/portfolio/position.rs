//! Pure position arithmetic shared by the analyzer, scorer and backtester.

use crate::currency::Currency;
use sentinel_instrument::Ccy;

/// Position value in its local currency.
pub fn value_local(quantity: f64, price: f64) -> f64 {
    quantity * price
}

/// Position value converted to EUR.
pub async fn value_eur(currency: &Currency, quantity: f64, price: f64, ccy: &Ccy) -> f64 {
    currency.to_eur(value_local(quantity, price), ccy).await
}

/// Allocation fraction of a position within the portfolio; zero total yields zero.
pub fn allocation_pct(value_eur: f64, total_eur: f64) -> f64 {
    if total_eur <= 0.0 {
        return 0.0;
    }
    value_eur / total_eur
}

/// Profit as `(fraction, absolute value in local currency)`.
/// A zero or negative average cost yields `(0, 0)`.
pub fn profit(quantity: f64, current_price: f64, avg_cost: f64) -> (f64, f64) {
    if avg_cost <= 0.0 {
        return (0.0, 0.0);
    }
    let pct = (current_price - avg_cost) / avg_cost;
    let value = (current_price - avg_cost) * quantity;
    (pct, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_allocation_pct() {
        assert_relative_eq!(allocation_pct(1_500.0, 10_000.0), 0.15);
        assert_eq!(allocation_pct(1_500.0, 0.0), 0.0);
    }

    #[test]
    fn test_profit() {
        let (pct, value) = profit(10.0, 130.0, 100.0);
        assert_relative_eq!(pct, 0.3);
        assert_relative_eq!(value, 300.0);
    }

    #[test]
    fn test_profit_zero_avg_cost() {
        assert_eq!(profit(10.0, 130.0, 0.0), (0.0, 0.0));
    }
}
