use chrono::NaiveDate;
use derive_more::Display;
use sentinel_instrument::{Ccy, Symbol};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cash flow categories mirrored from the broker statement.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum CashFlowKind {
    #[display("deposit")]
    Deposit,
    #[display("withdrawal")]
    Withdrawal,
    #[display("dividend")]
    Dividend,
    #[display("tax")]
    Tax,
    #[display("block")]
    Block,
    #[display("unblock")]
    Unblock,
}

impl CashFlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Dividend => "dividend",
            Self::Tax => "tax",
            Self::Block => "block",
            Self::Unblock => "unblock",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deposit" => Some(Self::Deposit),
            "withdrawal" => Some(Self::Withdrawal),
            "dividend" => Some(Self::Dividend),
            "tax" => Some(Self::Tax),
            "block" => Some(Self::Block),
            "unblock" => Some(Self::Unblock),
            _ => None,
        }
    }
}

/// Append-only cash flow row, deduplicated by content hash so identical entries on
/// the same day collapse into one.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CashFlowRecord {
    pub content_hash: String,
    pub date: NaiveDate,
    pub kind: CashFlowKind,
    pub amount: f64,
    pub currency: Ccy,
    pub comment: Option<String>,
    pub raw: serde_json::Value,
}

impl CashFlowRecord {
    pub fn new(
        date: NaiveDate,
        kind: CashFlowKind,
        amount: f64,
        currency: Ccy,
        comment: Option<String>,
        raw: serde_json::Value,
    ) -> Self {
        let content_hash = content_hash(date, kind, amount, &currency, comment.as_deref());
        Self {
            content_hash,
            date,
            kind,
            amount,
            currency,
            comment,
            raw,
        }
    }
}

/// Stable hash over the identifying fields of a cash flow entry.
pub fn content_hash(
    date: NaiveDate,
    kind: CashFlowKind,
    amount: f64,
    currency: &Ccy,
    comment: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(date.to_string().as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(format!("{amount:.6}").as_bytes());
    hasher.update(currency.as_str().as_bytes());
    hasher.update(comment.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-symbol dividend pool row tracking uninvested dividend cash.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DividendRow {
    pub symbol: Symbol,
    pub date: NaiveDate,
    pub amount_eur: f64,
    pub reinvested_eur: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable_and_discriminating() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let a = content_hash(date, CashFlowKind::Deposit, 100.0, &Ccy::EUR, None);
        let b = content_hash(date, CashFlowKind::Deposit, 100.0, &Ccy::EUR, None);
        let c = content_hash(date, CashFlowKind::Deposit, 100.01, &Ccy::EUR, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_cash_flow_kind_round_trip() {
        for kind in [
            CashFlowKind::Deposit,
            CashFlowKind::Withdrawal,
            CashFlowKind::Dividend,
            CashFlowKind::Tax,
            CashFlowKind::Block,
            CashFlowKind::Unblock,
        ] {
            assert_eq!(CashFlowKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CashFlowKind::parse("interest"), None);
    }
}
