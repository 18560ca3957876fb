use crate::{
    config::Settings,
    currency::Currency,
    error::SentinelError,
    portfolio::Portfolio,
    scoring::{
        price_validator::PriceValidator,
        sell::{DrawdownStats, PortfolioView, SellCandidate, SellScore, SellSettings, SellWeights},
        technicals::TechnicalData,
    },
};
use chrono::{NaiveDate, Utc};
use sentinel_instrument::market::PriceBar;
use sentinel_store::Store;
use std::sync::Arc;

/// Sell-priority model: eligibility gates plus the weighted component blend.
pub mod sell;

/// Technical indicators and the composite security score.
pub mod technicals;

/// Corrupted-price detection, interpolation and trade blocking.
pub mod price_validator;

/// Conviction adjustment applied to a security's score.
///
/// Sign-aware scaling: a bullish multiplier (> 1) boosts gains and damps losses, a
/// bearish one (< 1) does the reverse. A multiplier of zero excludes the security
/// (callers skip it before reaching here, but the function is total anyway).
pub fn adjust_score_for_conviction(score: f64, multiplier: f64) -> f64 {
    if multiplier <= 0.0 {
        return 0.0;
    }
    if score >= 0.0 {
        score * multiplier
    } else {
        score / multiplier
    }
}

/// Drawdown analytics over an ascending close series: current drawdown from the
/// trailing peak and the number of days spent under it.
pub fn drawdown_stats(bars: &[PriceBar]) -> Option<DrawdownStats> {
    let last = bars.last()?;
    let mut peak = f64::MIN;
    let mut peak_date = last.date;
    for bar in bars {
        if bar.close > peak {
            peak = bar.close;
            peak_date = bar.date;
        }
    }
    if peak <= 0.0 {
        return None;
    }
    Some(DrawdownStats {
        current_drawdown: last.close / peak - 1.0,
        days_in_drawdown: (last.date - peak_date).num_days(),
    })
}

/// Scores every held position for sell priority.
#[derive(Clone)]
pub struct SellScorer {
    store: Arc<dyn Store>,
    portfolio: Portfolio,
    currency: Currency,
    settings: Settings,
}

impl std::fmt::Debug for SellScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SellScorer").finish_non_exhaustive()
    }
}

impl SellScorer {
    pub fn new(
        store: Arc<dyn Store>,
        portfolio: Portfolio,
        currency: Currency,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            portfolio,
            currency,
            settings,
        }
    }

    async fn sell_settings(&self) -> SellSettings {
        SellSettings {
            min_hold_days: self.settings.get_i64("min_hold_days", 90).await,
            sell_cooldown_days: self.settings.get_i64("sell_cooldown_days", 180).await,
            max_loss_threshold: self.settings.get_f64("max_loss_threshold", -0.20).await,
            min_sell_value_eur: self.settings.get_f64("min_sell_value", 25.0).await,
        }
    }

    /// Score all held positions, highest priority first.
    pub async fn score_all(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<Vec<SellScore>, SentinelError> {
        let sell_settings = self.sell_settings().await;
        let weights = SellWeights::default();
        let now = as_of_date
            .and_then(|date| date.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);

        let allocations = self.portfolio.allocations().await?;
        let targets = self.portfolio.target_allocations().await?;
        let view = PortfolioView {
            total_value_eur: self.portfolio.total_value().await?,
            geography_allocations: allocations.by_geography,
            industry_allocations: allocations.by_industry,
            geography_targets: targets.geography,
            industry_targets: targets.industry,
        };

        let validator = PriceValidator::new();
        let mut scores = Vec::new();

        for position in self.store.positions().await? {
            let Some(security) = self.store.security(&position.symbol).await? else {
                continue;
            };

            let bars = self
                .store
                .prices(&position.symbol, Some(365), as_of_date)
                .await?;
            let ascending = {
                let mut bars = validator.validate_series_desc(&bars);
                bars.reverse();
                bars
            };

            let current_price = position
                .current_price
                .filter(|price| *price > 0.0)
                .or_else(|| ascending.last().map(|bar| bar.close))
                .unwrap_or(0.0);
            let price_eur = self
                .currency
                .to_eur(current_price, &position.currency)
                .await;

            let candidate = SellCandidate {
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                avg_cost: position.avg_cost.unwrap_or(current_price),
                current_price,
                price_eur,
                min_lot: security.min_lot,
                allow_sell: security.allow_sell,
                first_bought_at: security.first_bought_at,
                last_sold_at: security.last_sold_at,
                geographies: security.geographies(),
                industries: security.industries(),
            };

            let technical: Option<TechnicalData> = technicals::technical_data(&ascending);
            let drawdown = drawdown_stats(&ascending);

            scores.push(sell::calculate_sell_score(
                &candidate,
                &view,
                technical.as_ref(),
                drawdown.as_ref(),
                &weights,
                &sell_settings,
                now,
            ));
        }

        scores.sort_by(|a, b| b.total_score.total_cmp(&a.total_score));
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::date;
    use approx::assert_relative_eq;

    #[test]
    fn test_adjust_score_for_conviction() {
        struct TestCase {
            score: f64,
            multiplier: f64,
            expected: f64,
        }

        let cases = vec![
            TestCase {
                score: 0.4,
                multiplier: 1.0,
                expected: 0.4,
            },
            TestCase {
                score: 0.4,
                multiplier: 2.0,
                expected: 0.8,
            },
            TestCase {
                score: -0.4,
                multiplier: 2.0,
                expected: -0.2,
            },
            TestCase {
                score: 0.4,
                multiplier: 0.5,
                expected: 0.2,
            },
            TestCase {
                score: -0.4,
                multiplier: 0.5,
                expected: -0.8,
            },
            TestCase {
                score: 0.4,
                multiplier: 0.0,
                expected: 0.0,
            },
        ];

        for test in &cases {
            assert_relative_eq!(
                adjust_score_for_conviction(test.score, test.multiplier),
                test.expected,
            );
        }
    }

    #[test]
    fn test_drawdown_stats() {
        let mut bars = Vec::new();
        for (offset, close) in [100.0, 120.0, 110.0, 95.0].iter().enumerate() {
            bars.push(PriceBar::from_close(
                date(2024, 1, 1) + chrono::Days::new(offset as u64),
                *close,
            ));
        }

        let stats = drawdown_stats(&bars).unwrap();
        assert_relative_eq!(stats.current_drawdown, 95.0 / 120.0 - 1.0);
        assert_eq!(stats.days_in_drawdown, 2);
    }

    #[test]
    fn test_drawdown_stats_empty() {
        assert!(drawdown_stats(&[]).is_none());
    }
}
