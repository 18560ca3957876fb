use crate::{
    config::Settings, error::SentinelError, planner::ml, portfolio::Portfolio,
    scoring::adjust_score_for_conviction,
};
use chrono::NaiveDate;
use sentinel_instrument::Symbol;
use sentinel_store::{Store, security::Security};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

const IDEAL_CACHE_KEY: &str = "planner:ideal_portfolio";
const IDEAL_CACHE_TTL_SECONDS: i64 = 600;

/// Position-size constraints, as fractions.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AllocationConstraints {
    pub max_position: f64,
    pub min_position: f64,
    pub cash_target: f64,
}

/// Ideal-weight synthesis from scores, diversification and caps. (C4)
#[derive(Clone)]
pub struct AllocationCalculator {
    store: Arc<dyn Store>,
    portfolio: Portfolio,
    settings: Settings,
}

impl std::fmt::Debug for AllocationCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationCalculator").finish_non_exhaustive()
    }
}

impl AllocationCalculator {
    pub fn new(store: Arc<dyn Store>, portfolio: Portfolio, settings: Settings) -> Self {
        Self {
            store,
            portfolio,
            settings,
        }
    }

    /// Per-tag deviation of a security from allocation targets, averaged over all
    /// its tags and clamped to [-1, +1]. Positive = underweight = boost.
    fn diversification_score(
        security: &Security,
        current: &crate::portfolio::Allocations,
        targets: &crate::portfolio::TargetAllocations,
    ) -> f64 {
        let mut deviations = Vec::new();

        for geo in security.geographies() {
            let target = targets.geography.get(&geo).copied().unwrap_or(0.0);
            let current = current.by_geography.get(&geo).copied().unwrap_or(0.0);
            deviations.push(target - current);
        }
        for ind in security.industries() {
            let target = targets.industry.get(&ind).copied().unwrap_or(0.0);
            let current = current.by_industry.get(&ind).copied().unwrap_or(0.0);
            deviations.push(target - current);
        }

        if deviations.is_empty() {
            return 0.0;
        }
        (deviations.iter().sum::<f64>() / deviations.len() as f64).clamp(-1.0, 1.0)
    }

    /// Compute `symbol -> weight` with `sum(weights) <= 1 - cash_target`.
    ///
    /// Cached for ten minutes on the live path; an `as_of_date` (backtest) skips
    /// the cache entirely.
    pub async fn calculate_ideal_portfolio(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<HashMap<Symbol, f64>, SentinelError> {
        if as_of_date.is_none() {
            if let Ok(Some(cached)) = self.store.cache_get(IDEAL_CACHE_KEY).await {
                if let Ok(parsed) = serde_json::from_str(&cached) {
                    return Ok(parsed);
                }
            }
        }

        let securities = self.store.securities(true).await?;
        let symbols: Vec<Symbol> = securities.iter().map(|s| s.symbol.clone()).collect();
        let as_of = as_of_date
            .and_then(|date| date.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc());
        let wavelet_scores = self.store.latest_scores(&symbols, as_of).await?;

        // Optional ML blend; on any error the wavelet scores stand alone.
        let ml_base_url = self
            .settings
            .get_str("ml_service_base_url", "http://localhost:8001")
            .await;
        let ml_scores = ml::fetch_scores(&ml_base_url, &symbols, as_of)
            .await
            .unwrap_or_default();

        let current = self.portfolio.allocations().await?;
        let targets = self.portfolio.target_allocations().await?;
        let div_impact = self
            .settings
            .get_f64("diversification_impact_pct", 10.0)
            .await
            / 100.0;

        let mut scores: HashMap<Symbol, f64> = HashMap::new();
        for security in &securities {
            let multiplier = security.user_multiplier;
            if multiplier <= 0.0 {
                continue;
            }

            let base = ml_scores
                .get(&security.symbol)
                .or_else(|| wavelet_scores.get(&security.symbol))
                .copied()
                .unwrap_or(0.0);
            let mut adjusted = adjust_score_for_conviction(base, multiplier);

            if div_impact > 0.0 {
                let deviation = Self::diversification_score(security, &current, &targets);
                adjusted *= 1.0 + deviation * div_impact;
            }

            scores.insert(security.symbol.clone(), adjusted);
        }

        // Dividend-reinvestment boost, proportional to each pool's share.
        let max_boost = self
            .settings
            .get_f64("max_dividend_reinvestment_boost", 0.15)
            .await;
        if max_boost > 0.0 {
            let pools = self.store.uninvested_dividends().await?;
            let total_pool: f64 = pools.values().sum();
            if total_pool > 0.0 {
                for (symbol, pool) in pools {
                    if let Some(score) = scores.get_mut(&symbol) {
                        *score += (pool / total_pool) * max_boost;
                    }
                }
            }
        }

        // Keep positive scores, plus anything the user is strongly convinced about.
        let multipliers: HashMap<&Symbol, f64> = securities
            .iter()
            .map(|s| (&s.symbol, s.user_multiplier))
            .collect();
        scores.retain(|symbol, score| {
            *score > 0.0 || multipliers.get(symbol).copied().unwrap_or(1.0) > 1.0
        });

        if scores.is_empty() {
            return Ok(HashMap::new());
        }

        let constraints = AllocationConstraints {
            max_position: self.settings.get_f64("max_position_pct", 20.0).await / 100.0,
            min_position: self.settings.get_f64("min_position_pct", 2.0).await / 100.0,
            cash_target: self.settings.get_f64("target_cash_pct", 5.0).await / 100.0,
        };

        let allocations = classic_allocation(&scores, &constraints);

        if as_of_date.is_none() {
            if let Ok(document) = serde_json::to_string(&allocations) {
                if let Err(error) = self
                    .store
                    .cache_set(IDEAL_CACHE_KEY, &document, IDEAL_CACHE_TTL_SECONDS)
                    .await
                {
                    debug!(%error, "failed to cache ideal portfolio");
                }
            }
        }

        Ok(allocations)
    }
}

/// Classic wavelet-based allocation: min-max normalise positive scores, emphasise
/// differentiation with `(norm + 0.1)^2`, allocate `1 - cash_target`
/// proportionally, clamp each weight to the position bounds, then rescale so the
/// clamped weights again sum to the allocable fraction.
pub fn classic_allocation(
    scores: &HashMap<Symbol, f64>,
    constraints: &AllocationConstraints,
) -> HashMap<Symbol, f64> {
    let positive: HashMap<&Symbol, f64> = scores
        .iter()
        .filter(|(_, score)| **score > 0.0)
        .map(|(symbol, score)| (symbol, *score))
        .collect();

    if positive.is_empty() {
        return HashMap::new();
    }

    let min_score = positive.values().copied().fold(f64::INFINITY, f64::min);
    let max_score = positive.values().copied().fold(f64::NEG_INFINITY, f64::max);
    let score_range = max_score - min_score;

    let normalized: HashMap<&Symbol, f64> = positive
        .iter()
        .map(|(symbol, score)| {
            let norm = if score_range > 0.0 {
                (score - min_score) / score_range
            } else {
                0.5
            };
            (*symbol, (norm + 0.1).powi(2))
        })
        .collect();

    let total_weight: f64 = normalized.values().sum();
    if total_weight <= 0.0 {
        return HashMap::new();
    }
    let allocable = 1.0 - constraints.cash_target;

    let mut allocations: HashMap<Symbol, f64> = normalized
        .into_iter()
        .map(|(symbol, weight)| {
            let raw = (weight / total_weight) * allocable;
            (
                symbol.clone(),
                raw.clamp(constraints.min_position, constraints.max_position),
            )
        })
        .collect();

    let alloc_sum: f64 = allocations.values().sum();
    if alloc_sum > 0.0 {
        let scale = allocable / alloc_sum;
        for weight in allocations.values_mut() {
            *weight *= scale;
        }
    }

    allocations
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn constraints() -> AllocationConstraints {
        AllocationConstraints {
            max_position: 0.20,
            min_position: 0.02,
            cash_target: 0.05,
        }
    }

    #[test]
    fn test_classic_allocation_orders_by_score() {
        let scores = HashMap::from([
            (Symbol::new("A"), 0.8),
            (Symbol::new("B"), 0.4),
            (Symbol::new("C"), 0.2),
        ]);

        let allocations = classic_allocation(&scores, &constraints());
        assert_eq!(allocations.len(), 3);

        let a = allocations[&Symbol::new("A")];
        let b = allocations[&Symbol::new("B")];
        let c = allocations[&Symbol::new("C")];
        assert!(a > b && b > c, "expected A > B > C, got {a} {b} {c}");

        let sum: f64 = allocations.values().sum();
        assert_relative_eq!(sum, 0.95, epsilon = 1e-6);
    }

    #[test]
    fn test_classic_allocation_empty_for_non_positive() {
        let scores = HashMap::from([(Symbol::new("A"), 0.0), (Symbol::new("B"), -0.5)]);
        assert!(classic_allocation(&scores, &constraints()).is_empty());
    }

    #[test]
    fn test_classic_allocation_single_security_hits_cap() {
        let scores = HashMap::from([(Symbol::new("A"), 0.8)]);
        let allocations = classic_allocation(&scores, &constraints());
        // One security: clamped to max then rescaled back up to the allocable sum.
        assert_eq!(allocations.len(), 1);
        assert_relative_eq!(allocations[&Symbol::new("A")], 0.95, epsilon = 1e-9);
    }
}
