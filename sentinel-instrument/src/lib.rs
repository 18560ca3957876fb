#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Sentinel-Instrument
//! Sentinel-Instrument contains the core Symbol, Side, Currency and market data structures
//! shared by the store, the broker adapter, and the decision kernel.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::borrow::Borrow;

/// Market data bar structures.
///
/// eg/ `PriceBar`.
pub mod market;

/// Broker symbol for a tradeable security - globally unique within the universe.
///
/// Symbols carry the broker's exchange suffix, eg/ "AAPL.US", "ASML.EU", "0700.AS".
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, Default,
)]
pub struct Symbol(SmolStr);

impl Symbol {
    /// Construct a new [`Symbol`] from the provided `Into<SmolStr>`.
    pub fn new<S>(symbol: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// True if this symbol denotes an actual stock position, rather than an FX pair
    /// (contains "/"), an option (leading "+"), or another derivative (leading "DGT").
    pub fn is_stock(&self) -> bool {
        let s = self.0.as_str();
        !s.contains('/') && !s.starts_with('+') && !s.starts_with("DGT")
    }

    /// True if the symbol trades on an Asian market (broker suffix ".AS"), which
    /// requires a limit price on order submission.
    pub fn is_asian_market(&self) -> bool {
        self.0.as_str().ends_with(".AS")
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<SmolStr> for Symbol {
    fn from(value: SmolStr) -> Self {
        Self(value)
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        self.0.borrow()
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

/// ISO-4217 style currency code, uppercase, eg/ "EUR", "USD", "HKD".
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, Default,
)]
pub struct Ccy(SmolStr);

impl Ccy {
    pub const EUR: Ccy = Ccy(SmolStr::new_static("EUR"));

    /// Construct a new uppercase [`Ccy`] from the provided `Into<SmolStr>`.
    pub fn new<S>(code: S) -> Self
    where
        S: Into<SmolStr>,
    {
        let code = code.into();
        if code.chars().all(|c| c.is_ascii_uppercase()) {
            Self(code)
        } else {
            Self(SmolStr::new(code.to_uppercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_eur(&self) -> bool {
        self.0.as_str() == "EUR"
    }
}

impl From<&str> for Ccy {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Ccy {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for Ccy {
    fn borrow(&self) -> &str {
        self.0.borrow()
    }
}

/// Side of a trade or order - Buy or Sell.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub enum Side {
    #[serde(alias = "buy", alias = "BUY", alias = "b")]
    #[display("BUY")]
    Buy,
    #[serde(alias = "sell", alias = "SELL", alias = "s")]
    #[display("SELL")]
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Parse from the broker's 1/2 wire encoding.
    pub fn from_broker_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Buy),
            2 => Some(Self::Sell),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_is_stock() {
        struct TestCase {
            input: &'static str,
            expected: bool,
        }

        let cases = vec![
            TestCase {
                input: "AAPL.US",
                expected: true,
            },
            TestCase {
                input: "EUR/USD",
                expected: false,
            },
            TestCase {
                input: "+VXX.17MAY2024.C12.5",
                expected: false,
            },
            TestCase {
                input: "DGT7001",
                expected: false,
            },
        ];

        for (index, test) in cases.iter().enumerate() {
            assert_eq!(
                Symbol::new(test.input).is_stock(),
                test.expected,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_symbol_asian_market() {
        assert!(Symbol::new("0700.AS").is_asian_market());
        assert!(!Symbol::new("AAPL.US").is_asian_market());
    }

    #[test]
    fn test_ccy_uppercases() {
        assert_eq!(Ccy::new("usd"), Ccy::new("USD"));
        assert!(Ccy::new("eur").is_eur());
    }

    #[test]
    fn test_side_broker_code() {
        assert_eq!(Side::from_broker_code(1), Some(Side::Buy));
        assert_eq!(Side::from_broker_code(2), Some(Side::Sell));
        assert_eq!(Side::from_broker_code(3), None);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }
}
