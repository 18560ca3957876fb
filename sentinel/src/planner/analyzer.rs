use crate::{currency::Currency, error::SentinelError, portfolio::Portfolio};
use chrono::NaiveDate;
use sentinel_instrument::Symbol;
use sentinel_store::Store;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

const ALLOCATIONS_CACHE_KEY: &str = "planner:current_allocations";
const ALLOCATIONS_CACHE_TTL_SECONDS: i64 = 300;

/// Alignment buckets for the operator-facing rebalance summary. These thresholds do
/// not gate the rebalance engine.
const ALIGNED_THRESHOLD: f64 = 0.05;

/// Operator-facing summary of how far the portfolio sits from its ideal.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct RebalanceSummary {
    pub total_securities: usize,
    pub aligned_count: usize,
    pub needs_adjustment_count: usize,
    pub total_deviation: f64,
    pub max_deviation: f64,
    pub average_deviation: f64,
    pub status: RebalanceStatus,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStatus {
    #[default]
    Aligned,
    MinorDrift,
    NeedsRebalance,
}

/// Current-state queries over the portfolio. (C6)
#[derive(Clone)]
pub struct PortfolioAnalyzer {
    store: Arc<dyn Store>,
    portfolio: Portfolio,
    currency: Currency,
}

impl std::fmt::Debug for PortfolioAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioAnalyzer").finish_non_exhaustive()
    }
}

impl PortfolioAnalyzer {
    pub fn new(store: Arc<dyn Store>, portfolio: Portfolio, currency: Currency) -> Self {
        Self {
            store,
            portfolio,
            currency,
        }
    }

    /// Current allocation fractions by symbol. Cached for five minutes on the live
    /// path; an `as_of_date` (backtest) skips the cache.
    pub async fn current_allocations(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<HashMap<Symbol, f64>, SentinelError> {
        if as_of_date.is_none() {
            if let Ok(Some(cached)) = self.store.cache_get(ALLOCATIONS_CACHE_KEY).await {
                if let Ok(parsed) = serde_json::from_str(&cached) {
                    return Ok(parsed);
                }
            }
        }

        let positions = self.store.positions().await?;
        let total_value = self.portfolio.total_value().await?;

        let mut allocations = HashMap::new();
        if total_value <= 0.0 {
            return Ok(allocations);
        }

        for pos in positions {
            if pos.quantity <= 0.0 || pos.price() <= 0.0 {
                continue;
            }
            let value_eur = self
                .currency
                .to_eur(pos.value_local(), &pos.currency)
                .await;
            allocations.insert(pos.symbol, value_eur / total_value);
        }

        if as_of_date.is_none() {
            if let Ok(document) = serde_json::to_string(&allocations) {
                if let Err(error) = self
                    .store
                    .cache_set(ALLOCATIONS_CACHE_KEY, &document, ALLOCATIONS_CACHE_TTL_SECONDS)
                    .await
                {
                    debug!(%error, "failed to cache current allocations");
                }
            }
        }

        Ok(allocations)
    }

    /// Bucket every symbol by |current - ideal| deviation.
    pub fn summarize(
        current: &HashMap<Symbol, f64>,
        ideal: &HashMap<Symbol, f64>,
    ) -> RebalanceSummary {
        if current.is_empty() || ideal.is_empty() {
            return RebalanceSummary::default();
        }

        let all_symbols: std::collections::HashSet<&Symbol> =
            current.keys().chain(ideal.keys()).collect();

        let deviations: Vec<f64> = all_symbols
            .iter()
            .map(|symbol| {
                let current_pct = current.get(*symbol).copied().unwrap_or(0.0);
                let ideal_pct = ideal.get(*symbol).copied().unwrap_or(0.0);
                (current_pct - ideal_pct).abs()
            })
            .collect();

        let total_deviation: f64 = deviations.iter().sum();
        let max_deviation = deviations.iter().copied().fold(0.0, f64::max);
        let aligned_count = deviations
            .iter()
            .filter(|d| **d < ALIGNED_THRESHOLD)
            .count();

        let status = if max_deviation < ALIGNED_THRESHOLD {
            RebalanceStatus::Aligned
        } else if max_deviation < ALIGNED_THRESHOLD * 2.0 {
            RebalanceStatus::MinorDrift
        } else {
            RebalanceStatus::NeedsRebalance
        };

        RebalanceSummary {
            total_securities: all_symbols.len(),
            aligned_count,
            needs_adjustment_count: deviations.len() - aligned_count,
            total_deviation,
            max_deviation,
            average_deviation: total_deviation / deviations.len() as f64,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_buckets() {
        let current = HashMap::from([
            (Symbol::new("A"), 0.10),
            (Symbol::new("B"), 0.20),
            (Symbol::new("C"), 0.05),
        ]);
        let ideal = HashMap::from([
            (Symbol::new("A"), 0.12), // 2% off: aligned
            (Symbol::new("B"), 0.13), // 7% off: minor drift
            (Symbol::new("C"), 0.20), // 15% off: needs rebalance
        ]);

        let summary = PortfolioAnalyzer::summarize(&current, &ideal);
        assert_eq!(summary.total_securities, 3);
        assert_eq!(summary.aligned_count, 1);
        assert_eq!(summary.needs_adjustment_count, 2);
        assert_eq!(summary.status, RebalanceStatus::NeedsRebalance);
    }

    #[test]
    fn test_summarize_empty() {
        let summary = PortfolioAnalyzer::summarize(&HashMap::new(), &HashMap::new());
        assert_eq!(summary.status, RebalanceStatus::Aligned);
        assert_eq!(summary.total_securities, 0);
    }
}
