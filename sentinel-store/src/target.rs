use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Allocation target dimension.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[display("geography")]
    Geography,
    #[display("industry")]
    Industry,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Geography => "geography",
            Self::Industry => "industry",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "geography" => Some(Self::Geography),
            "industry" => Some(Self::Industry),
            _ => None,
        }
    }
}

/// Relative allocation target weight for one geography or industry bucket.
///
/// Weights are relative and normalised at read time.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct AllocationTarget {
    pub kind: TargetKind,
    pub name: String,
    pub weight: f64,
}

/// Normalise a weight map so values sum to 1.0; an all-zero map normalises to empty.
pub fn normalize_weights(weights: &HashMap<String, f64>) -> HashMap<String, f64> {
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        return HashMap::new();
    }
    weights
        .iter()
        .map(|(name, weight)| (name.clone(), weight / total))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_weights() {
        let weights = HashMap::from([(String::from("US"), 3.0), (String::from("EU"), 1.0)]);
        let normalized = normalize_weights(&weights);
        assert_eq!(normalized["US"], 0.75);
        assert_eq!(normalized["EU"], 0.25);
    }

    #[test]
    fn test_normalize_weights_zero_sum_is_empty() {
        let weights = HashMap::from([(String::from("US"), 0.0)]);
        assert!(normalize_weights(&weights).is_empty());
    }
}
