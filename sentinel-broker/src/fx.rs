//! FX conversion routing over the broker's fixed set of currency pairs.
//!
//! EUR<->USD, EUR<->GBP and GBP<->USD trade through one ITS pair each; HKD<->EUR and
//! HKD<->USD are direct MONEY-market pairs. GBP<->HKD has no direct pair and routes
//! via EUR. The BUY/SELL direction on the pair is derived from the routing table.

use sentinel_instrument::{Ccy, Side, Symbol};

/// One conversion hop: trade `pair` with `side` to move funds between the two legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FxHop {
    pub pair: Symbol,
    pub side: Side,
}

/// A conversion route of one or two hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FxRoute {
    pub hops: Vec<FxHop>,
}

/// Direct pairs available at the broker: (from, to) -> (pair symbol, side).
const DIRECT_PAIRS: &[((&str, &str), (&str, Side))] = &[
    (("EUR", "USD"), ("EURUSD_T0.ITS", Side::Buy)),
    (("USD", "EUR"), ("EURUSD_T0.ITS", Side::Sell)),
    (("EUR", "GBP"), ("EURGBP_T0.ITS", Side::Buy)),
    (("GBP", "EUR"), ("EURGBP_T0.ITS", Side::Sell)),
    (("GBP", "USD"), ("GBPUSD_T0.ITS", Side::Buy)),
    (("USD", "GBP"), ("GBPUSD_T0.ITS", Side::Sell)),
    (("EUR", "HKD"), ("HKD/EUR", Side::Buy)),
    (("HKD", "EUR"), ("HKD/EUR", Side::Sell)),
    (("USD", "HKD"), ("HKD/USD", Side::Buy)),
    (("HKD", "USD"), ("HKD/USD", Side::Sell)),
];

/// Currencies the converter fetches rates for (EUR is the pivot and excluded).
pub const RATE_FETCH_CURRENCIES: &[&str] = &[
    "USD", "GBP", "HKD", "CHF", "JPY", "CNY", "CAD", "AUD", "SGD", "NOK", "SEK", "DKK", "PLN",
    "CZK",
];

/// Fallback rates (1 unit = X EUR) used when no fetched or cached rate exists.
pub const DEFAULT_RATES: &[(&str, f64)] = &[
    ("EUR", 1.0),
    ("USD", 0.85),
    ("GBP", 1.15),
    ("HKD", 0.11),
    ("CHF", 1.08),
    ("JPY", 0.0054),
];

fn direct_hop(from: &Ccy, to: &Ccy) -> Option<FxHop> {
    DIRECT_PAIRS
        .iter()
        .find(|((f, t), _)| *f == from.as_str() && *t == to.as_str())
        .map(|(_, (pair, side))| FxHop {
            pair: Symbol::new(*pair),
            side: *side,
        })
}

/// Resolve the conversion route between two currencies, if one exists.
pub fn route(from: &Ccy, to: &Ccy) -> Option<FxRoute> {
    if from == to {
        return None;
    }

    if let Some(hop) = direct_hop(from, to) {
        return Some(FxRoute { hops: vec![hop] });
    }

    // No direct pair: route via EUR (eg/ GBP<->HKD).
    let eur = Ccy::EUR;
    let first = direct_hop(from, &eur)?;
    let second = direct_hop(&eur, to)?;
    Some(FxRoute {
        hops: vec![first, second],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_routes() {
        struct TestCase {
            from: &'static str,
            to: &'static str,
            expected_pair: &'static str,
            expected_side: Side,
        }

        let cases = vec![
            TestCase {
                from: "EUR",
                to: "USD",
                expected_pair: "EURUSD_T0.ITS",
                expected_side: Side::Buy,
            },
            TestCase {
                from: "USD",
                to: "EUR",
                expected_pair: "EURUSD_T0.ITS",
                expected_side: Side::Sell,
            },
            TestCase {
                from: "HKD",
                to: "USD",
                expected_pair: "HKD/USD",
                expected_side: Side::Sell,
            },
            TestCase {
                from: "HKD",
                to: "EUR",
                expected_pair: "HKD/EUR",
                expected_side: Side::Sell,
            },
        ];

        for (index, test) in cases.iter().enumerate() {
            let route = route(&Ccy::new(test.from), &Ccy::new(test.to)).unwrap();
            assert_eq!(route.hops.len(), 1, "TC{index} hop count");
            assert_eq!(
                route.hops[0].pair,
                Symbol::new(test.expected_pair),
                "TC{index} pair"
            );
            assert_eq!(route.hops[0].side, test.expected_side, "TC{index} side");
        }
    }

    #[test]
    fn test_gbp_hkd_routes_via_eur() {
        let route = route(&Ccy::new("GBP"), &Ccy::new("HKD")).unwrap();
        assert_eq!(route.hops.len(), 2);
        assert_eq!(route.hops[0].pair, Symbol::new("EURGBP_T0.ITS"));
        assert_eq!(route.hops[0].side, Side::Sell);
        assert_eq!(route.hops[1].pair, Symbol::new("HKD/EUR"));
        assert_eq!(route.hops[1].side, Side::Buy);
    }

    #[test]
    fn test_same_currency_has_no_route() {
        assert_eq!(route(&Ccy::EUR, &Ccy::EUR), None);
    }
}
