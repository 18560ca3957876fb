use crate::{
    config::Settings,
    currency::Currency,
    error::SentinelError,
    planner::{
        allocation::AllocationCalculator,
        analyzer::{PortfolioAnalyzer, RebalanceSummary},
        models::TradeRecommendation,
        rebalance::RebalanceEngine,
    },
    portfolio::Portfolio,
};
use chrono::NaiveDate;
use sentinel_broker::Broker;
use sentinel_instrument::Symbol;
use sentinel_store::Store;
use std::{collections::HashMap, sync::Arc};

/// Ideal-weight synthesis from scores, diversification and caps. (C4)
pub mod allocation;

/// Current-state queries and the operator-facing rebalance summary. (C6)
pub mod analyzer;

/// External ML score fetch with total fallback.
pub mod ml;

/// The transient trade recommendation record.
pub mod models;

/// Target-vs-current delta to rounded, budget-feasible trade list. (C5)
pub mod rebalance;

/// Planner facade composing AllocationCalculator, PortfolioAnalyzer and
/// RebalanceEngine behind one entry point. (C7)
///
/// An `as_of_date` (the backtest simulation clock) propagates end-to-end and
/// disables all live caches, so no "future" data leaks into a decision.
#[derive(Clone)]
pub struct Planner {
    portfolio: Portfolio,
    allocation: AllocationCalculator,
    analyzer: PortfolioAnalyzer,
    rebalance: RebalanceEngine,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner").finish_non_exhaustive()
    }
}

impl Planner {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        portfolio: Portfolio,
        currency: Currency,
        settings: Settings,
    ) -> Self {
        let allocation =
            AllocationCalculator::new(Arc::clone(&store), portfolio.clone(), settings.clone());
        let analyzer =
            PortfolioAnalyzer::new(Arc::clone(&store), portfolio.clone(), currency.clone());
        let rebalance = RebalanceEngine::new(
            store,
            broker,
            portfolio.clone(),
            settings,
            currency,
        );

        Self {
            portfolio,
            allocation,
            analyzer,
            rebalance,
        }
    }

    pub async fn calculate_ideal_portfolio(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<HashMap<Symbol, f64>, SentinelError> {
        self.allocation.calculate_ideal_portfolio(as_of_date).await
    }

    pub async fn current_allocations(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<HashMap<Symbol, f64>, SentinelError> {
        self.analyzer.current_allocations(as_of_date).await
    }

    /// Generate trade recommendations to move toward the ideal portfolio, sorted
    /// by priority (sells first).
    pub async fn get_recommendations(
        &self,
        min_trade_value: Option<f64>,
        as_of_date: Option<NaiveDate>,
    ) -> Result<Vec<TradeRecommendation>, SentinelError> {
        let ideal = self.calculate_ideal_portfolio(as_of_date).await?;
        let current = self.current_allocations(as_of_date).await?;
        let total_value = self.portfolio.total_value().await?;

        self.rebalance
            .get_recommendations(&ideal, &current, total_value, min_trade_value, as_of_date)
            .await
    }

    /// Operator-facing alignment summary; does not gate the rebalance engine.
    pub async fn rebalance_summary(&self) -> Result<RebalanceSummary, SentinelError> {
        let current = self.current_allocations(None).await?;
        let ideal = self.calculate_ideal_portfolio(None).await?;
        Ok(PortfolioAnalyzer::summarize(&current, &ideal))
    }
}
