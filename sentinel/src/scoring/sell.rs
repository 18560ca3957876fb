//! Sell scoring: hard eligibility blocks plus a weighted multi-component priority.
//!
//! Any hard block yields an ineligible verdict with a human-readable reason and a
//! zero score; no error is ever raised across this boundary. Eligible positions get
//! a priority in [0, 1] and a lot-valid suggested quantity that never liquidates
//! the position entirely.

use crate::{scoring::technicals::TechnicalData, statistic};
use chrono::{DateTime, Utc};
use sentinel_instrument::Symbol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Floor of the suggested sell fraction.
pub const MIN_SELL_PCT: f64 = 0.10;
/// Cap of the suggested sell fraction.
pub const MAX_SELL_PCT: f64 = 0.50;

/// Component weights, normalised to sum 1.0 before use.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct SellWeights {
    pub underperformance: f64,
    pub time_held: f64,
    pub portfolio_balance: f64,
    pub instability: f64,
    pub drawdown: f64,
}

impl Default for SellWeights {
    fn default() -> Self {
        Self {
            underperformance: 0.35,
            time_held: 0.18,
            portfolio_balance: 0.18,
            instability: 0.14,
            drawdown: 0.15,
        }
    }
}

impl SellWeights {
    pub fn normalized(&self) -> Self {
        let sum = self.underperformance
            + self.time_held
            + self.portfolio_balance
            + self.instability
            + self.drawdown;
        if sum <= 0.0 {
            return Self::default();
        }
        Self {
            underperformance: self.underperformance / sum,
            time_held: self.time_held / sum,
            portfolio_balance: self.portfolio_balance / sum,
            instability: self.instability / sum,
            drawdown: self.drawdown / sum,
        }
    }
}

/// Thresholds governing the hard blocks, loaded from settings.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct SellSettings {
    pub min_hold_days: i64,
    pub sell_cooldown_days: i64,
    /// Loss fraction beyond which selling is blocked (strictly below; a position at
    /// exactly the threshold is not blocked).
    pub max_loss_threshold: f64,
    pub min_sell_value_eur: f64,
}

impl Default for SellSettings {
    fn default() -> Self {
        Self {
            min_hold_days: 90,
            sell_cooldown_days: 180,
            max_loss_threshold: -0.20,
            min_sell_value_eur: 25.0,
        }
    }
}

/// Drawdown analytics for one position.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct DrawdownStats {
    /// Current drawdown from the trailing peak, as a negative fraction.
    pub current_drawdown: f64,
    pub days_in_drawdown: i64,
}

/// One held position plus the security metadata the scorer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SellCandidate {
    pub symbol: Symbol,
    pub quantity: f64,
    /// Average cost per unit, local currency.
    pub avg_cost: f64,
    /// Current price per unit, local currency.
    pub current_price: f64,
    /// Current price per unit converted to EUR.
    pub price_eur: f64,
    pub min_lot: u32,
    pub allow_sell: bool,
    pub first_bought_at: Option<DateTime<Utc>>,
    pub last_sold_at: Option<DateTime<Utc>>,
    pub geographies: Vec<String>,
    pub industries: Vec<String>,
}

impl SellCandidate {
    fn last_transaction_at(&self) -> Option<DateTime<Utc>> {
        match (self.first_bought_at, self.last_sold_at) {
            (Some(bought), Some(sold)) => Some(bought.max(sold)),
            (Some(bought), None) => Some(bought),
            (None, Some(sold)) => Some(sold),
            (None, None) => None,
        }
    }
}

/// Allocation context shared across all candidates in one scoring pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioView {
    pub total_value_eur: f64,
    pub geography_allocations: HashMap<String, f64>,
    pub industry_allocations: HashMap<String, f64>,
    pub geography_targets: HashMap<String, f64>,
    pub industry_targets: HashMap<String, f64>,
}

/// Full verdict for one position.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SellScore {
    pub symbol: Symbol,
    pub eligible: bool,
    pub block_reason: Option<String>,
    pub underperformance_score: f64,
    pub time_held_score: f64,
    pub portfolio_balance_score: f64,
    pub instability_score: f64,
    pub drawdown_score: f64,
    pub total_score: f64,
    pub suggested_sell_pct: f64,
    pub suggested_sell_quantity: f64,
    pub suggested_sell_value_eur: f64,
    pub profit_pct: f64,
    pub days_held: i64,
}

impl SellScore {
    fn blocked(symbol: Symbol, reason: String, profit_pct: f64, days_held: i64) -> Self {
        Self {
            symbol,
            eligible: false,
            block_reason: Some(reason),
            underperformance_score: 0.0,
            time_held_score: 0.0,
            portfolio_balance_score: 0.0,
            instability_score: 0.0,
            drawdown_score: 0.0,
            total_score: 0.0,
            suggested_sell_pct: 0.0,
            suggested_sell_quantity: 0.0,
            suggested_sell_value_eur: 0.0,
            profit_pct,
            days_held,
        }
    }
}

/// Check the hard blocks. Returns the block reason, or `None` if selling may be
/// scored.
pub fn check_sell_eligibility(
    allow_sell: bool,
    profit_pct: f64,
    last_transaction_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    settings: &SellSettings,
) -> Option<String> {
    if !allow_sell {
        return Some(String::from("allow_sell=false"));
    }

    // Strict comparison: a loss at exactly the threshold does not block.
    if profit_pct < settings.max_loss_threshold {
        return Some(format!(
            "Loss {:.1}% exceeds {:.0}% threshold",
            profit_pct.abs() * 100.0,
            settings.max_loss_threshold.abs() * 100.0,
        ));
    }

    let Some(last_transaction) = last_transaction_at else {
        return None;
    };
    let days_since = (now - last_transaction).num_days();

    if days_since < settings.min_hold_days {
        return Some(format!(
            "Held only {days_since} days (min {})",
            settings.min_hold_days
        ));
    }

    if days_since < settings.sell_cooldown_days {
        return Some(format!(
            "Last transaction {days_since} days ago (cooldown {})",
            settings.sell_cooldown_days
        ));
    }

    None
}

/// Annualised-return-vs-target-band component. The 8-15% band scores low (keep);
/// mild underperformance scores high; windfalls above the band score moderate
/// (trim candidates).
pub fn underperformance_score(profit_pct: f64, days_held: i64) -> f64 {
    let annualized = statistic::annualized_return(profit_pct, days_held);

    if annualized < -0.10 {
        1.0
    } else if annualized < 0.0 {
        0.85
    } else if annualized < 0.04 {
        0.7
    } else if annualized < 0.08 {
        0.5
    } else if annualized <= 0.15 {
        0.15
    } else if annualized <= 0.30 {
        0.45
    } else {
        0.6
    }
}

/// Position-age component: young positions score 0 (the hold block applies first
/// anyway), multi-year holds score highest.
pub fn time_held_score(
    first_bought_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    min_hold_days: i64,
) -> (f64, i64) {
    let Some(bought) = first_bought_at else {
        return (0.0, 0);
    };
    let days_held = (now - bought).num_days();

    let score = if days_held < min_hold_days {
        0.0
    } else if days_held < 365 {
        0.25
    } else if days_held < 730 {
        0.6
    } else {
        1.0
    };
    (score, days_held)
}

/// Mean of country and industry overweights, plus a concentration bump for single
/// positions above 10% of the portfolio.
pub fn portfolio_balance_score(
    position_value_eur: f64,
    candidate: &SellCandidate,
    view: &PortfolioView,
) -> f64 {
    let mut overweights = Vec::new();

    for geo in &candidate.geographies {
        let current = view.geography_allocations.get(geo).copied().unwrap_or(0.0);
        let target = view.geography_targets.get(geo).copied().unwrap_or(0.0);
        overweights.push(current - target);
    }
    for ind in &candidate.industries {
        let current = view.industry_allocations.get(ind).copied().unwrap_or(0.0);
        let target = view.industry_targets.get(ind).copied().unwrap_or(0.0);
        overweights.push(current - target);
    }

    let mut score = if overweights.is_empty() {
        0.0
    } else {
        let avg = statistic::mean(&overweights);
        (avg * 5.0).clamp(0.0, 0.8)
    };

    if view.total_value_eur > 0.0 && position_value_eur / view.total_value_eur > 0.10 {
        score += 0.2;
    }

    score.clamp(0.0, 1.0)
}

/// Bubble/instability detection from technical indicators; neutral 0.3 when the
/// indicators are missing.
pub fn instability_score(technical: Option<&TechnicalData>) -> f64 {
    let Some(technical) = technical else {
        return 0.3;
    };

    let mut score: f64 = 0.3;

    if technical.historical_volatility > 1e-9 {
        let sigma_ratio = technical.current_volatility / technical.historical_volatility;
        if sigma_ratio > 1.0 {
            score += 0.3 * (sigma_ratio - 1.0).min(1.0);
        }
    }

    let deviation = technical.distance_from_ma_200.abs();
    if deviation > 0.2 {
        score += 0.4 * ((deviation - 0.2) / 0.3).min(1.0);
    }

    score.clamp(0.0, 1.0)
}

/// Severity/duration step function over position drawdown analytics; neutral 0.3
/// when the analytics are unavailable.
pub fn drawdown_score(stats: Option<&DrawdownStats>) -> f64 {
    let Some(stats) = stats else {
        return 0.3;
    };

    if stats.current_drawdown < -0.25 {
        1.0
    } else if stats.current_drawdown < -0.15 {
        if stats.days_in_drawdown > 180 {
            0.9
        } else if stats.days_in_drawdown > 90 {
            0.7
        } else {
            0.5
        }
    } else if stats.current_drawdown < -0.10 {
        0.3
    } else {
        0.1
    }
}

/// Round down to a whole number of lots.
pub fn round_to_lots(raw_quantity: f64, min_lot: u32) -> f64 {
    let lot = f64::from(min_lot.max(1));
    (raw_quantity / lot).floor() * lot
}

/// Size the sell from the total score: `MIN + score * (MAX - MIN)` of the position,
/// floored to lot size, capped so at least one lot remains, zeroed below the
/// minimum sell value. Returns `(quantity, pct)`.
pub fn determine_sell_quantity(
    total_score: f64,
    quantity: f64,
    min_lot: u32,
    price_eur: f64,
    min_sell_value_eur: f64,
) -> (f64, f64) {
    let pct =
        (MIN_SELL_PCT + total_score * (MAX_SELL_PCT - MIN_SELL_PCT)).clamp(MIN_SELL_PCT, MAX_SELL_PCT);

    let mut sell_quantity = round_to_lots(quantity * pct, min_lot);

    // Never liquidate entirely: keep at least one lot.
    let max_sell = quantity - f64::from(min_lot.max(1));
    if sell_quantity >= max_sell {
        sell_quantity = round_to_lots(max_sell.max(0.0), min_lot);
    }

    if sell_quantity < f64::from(min_lot.max(1)) {
        return (0.0, 0.0);
    }

    if sell_quantity * price_eur < min_sell_value_eur {
        return (0.0, 0.0);
    }

    let actual_pct = if quantity > 0.0 {
        sell_quantity / quantity
    } else {
        0.0
    };
    (sell_quantity, actual_pct)
}

/// Score one position end-to-end.
pub fn calculate_sell_score(
    candidate: &SellCandidate,
    view: &PortfolioView,
    technical: Option<&TechnicalData>,
    drawdown: Option<&DrawdownStats>,
    weights: &SellWeights,
    settings: &SellSettings,
    now: DateTime<Utc>,
) -> SellScore {
    let (profit_pct, _) = if candidate.avg_cost > 0.0 {
        (
            (candidate.current_price - candidate.avg_cost) / candidate.avg_cost,
            0.0,
        )
    } else {
        (0.0, 0.0)
    };

    let (time_score, days_held) =
        time_held_score(candidate.first_bought_at, now, settings.min_hold_days);

    if let Some(reason) = check_sell_eligibility(
        candidate.allow_sell,
        profit_pct,
        candidate.last_transaction_at(),
        now,
        settings,
    ) {
        return SellScore::blocked(candidate.symbol.clone(), reason, profit_pct, days_held);
    }

    let underperformance = underperformance_score(profit_pct, days_held);
    let position_value_eur = candidate.quantity * candidate.price_eur;
    let balance = portfolio_balance_score(position_value_eur, candidate, view);
    let instability = instability_score(technical);
    let drawdown = drawdown_score(drawdown);

    let weights = weights.normalized();
    let total_score = (underperformance * weights.underperformance
        + time_score * weights.time_held
        + balance * weights.portfolio_balance
        + instability * weights.instability
        + drawdown * weights.drawdown)
        .clamp(0.0, 1.0);

    let (sell_quantity, sell_pct) = determine_sell_quantity(
        total_score,
        candidate.quantity,
        candidate.min_lot,
        candidate.price_eur,
        settings.min_sell_value_eur,
    );

    SellScore {
        symbol: candidate.symbol.clone(),
        eligible: sell_quantity > 0.0,
        block_reason: (sell_quantity <= 0.0).then(|| String::from("Below minimum sell value")),
        underperformance_score: underperformance,
        time_held_score: time_score,
        portfolio_balance_score: balance,
        instability_score: instability,
        drawdown_score: drawdown,
        total_score,
        suggested_sell_pct: sell_pct,
        suggested_sell_quantity: sell_quantity,
        suggested_sell_value_eur: sell_quantity * candidate.price_eur,
        profit_pct,
        days_held,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::time_plus_days;
    use approx::assert_relative_eq;

    fn base_time() -> DateTime<Utc> {
        DateTime::<Utc>::MIN_UTC
    }

    fn candidate(avg_cost: f64, current_price: f64) -> SellCandidate {
        SellCandidate {
            symbol: Symbol::new("AAPL.US"),
            quantity: 10.0,
            avg_cost,
            current_price,
            price_eur: current_price,
            min_lot: 1,
            allow_sell: true,
            first_bought_at: Some(base_time()),
            last_sold_at: None,
            geographies: vec![String::from("US")],
            industries: vec![String::from("Tech")],
        }
    }

    fn view() -> PortfolioView {
        PortfolioView {
            total_value_eur: 10_000.0,
            geography_allocations: HashMap::from([(String::from("US"), 0.5)]),
            industry_allocations: HashMap::from([(String::from("Tech"), 0.3)]),
            geography_targets: HashMap::from([(String::from("US"), 0.4)]),
            industry_targets: HashMap::from([(String::from("Tech"), 0.25)]),
        }
    }

    fn now_after(days: u64) -> DateTime<Utc> {
        time_plus_days(base_time(), days)
    }

    #[test]
    fn test_hard_block_allow_sell() {
        let reason =
            check_sell_eligibility(false, 0.1, None, now_after(365), &SellSettings::default());
        assert_eq!(reason.as_deref(), Some("allow_sell=false"));
    }

    #[test]
    fn test_hard_block_loss_threshold_is_strict() {
        let settings = SellSettings::default();

        // 30% loss: blocked, reason carries both percentages.
        let reason = check_sell_eligibility(true, -0.30, None, now_after(365), &settings).unwrap();
        assert!(reason.contains("Loss 30.0%"));
        assert!(reason.contains("20%"));

        // Exactly at the threshold: NOT blocked.
        assert_eq!(
            check_sell_eligibility(true, -0.20, None, now_after(365), &settings),
            None
        );
    }

    #[test]
    fn test_hard_block_min_hold_and_cooldown() {
        let settings = SellSettings::default();
        let last_transaction = Some(base_time());

        let reason =
            check_sell_eligibility(true, 0.1, last_transaction, now_after(30), &settings).unwrap();
        assert!(reason.contains("Held only 30 days"));

        let reason =
            check_sell_eligibility(true, 0.1, last_transaction, now_after(120), &settings)
                .unwrap();
        assert!(reason.contains("cooldown 180"));

        assert_eq!(
            check_sell_eligibility(true, 0.1, last_transaction, now_after(200), &settings),
            None
        );
    }

    #[test]
    fn test_blocked_loss_scenario() {
        // avg 100 -> current 70, held a year: the loss block fires.
        let score = calculate_sell_score(
            &candidate(100.0, 70.0),
            &view(),
            None,
            None,
            &SellWeights::default(),
            &SellSettings::default(),
            now_after(365),
        );
        assert!(!score.eligible);
        let reason = score.block_reason.unwrap();
        assert!(reason.contains("Loss 30.0%"));
        assert!(reason.contains("20%"));
        assert_eq!(score.total_score, 0.0);
        assert_relative_eq!(score.profit_pct, -0.3);
    }

    #[test]
    fn test_eligible_winner_scenario() {
        // avg 100 -> current 130, held a year, overweight US/Tech, drawdown neutral.
        let score = calculate_sell_score(
            &candidate(100.0, 130.0),
            &view(),
            None,
            Some(&DrawdownStats {
                current_drawdown: -0.05,
                days_in_drawdown: 10,
            }),
            &SellWeights::default(),
            &SellSettings::default(),
            now_after(365),
        );

        assert!(score.eligible);
        assert!(score.total_score > 0.0 && score.total_score <= 1.0);
        assert!((MIN_SELL_PCT..=MAX_SELL_PCT).contains(&score.suggested_sell_pct));
        assert_eq!(score.suggested_sell_quantity % 1.0, 0.0);
        assert!(score.suggested_sell_quantity <= 10.0 - 1.0);
    }

    #[test]
    fn test_sell_quantity_never_liquidates() {
        // Even at maximum score, at least one lot remains.
        let (qty, _) = determine_sell_quantity(1.0, 10.0, 4, 100.0, 25.0);
        assert!(qty <= 10.0 - 4.0);
        assert_eq!(qty % 4.0, 0.0);
    }

    #[test]
    fn test_sell_quantity_below_min_value_is_zeroed() {
        let (qty, pct) = determine_sell_quantity(0.5, 10.0, 1, 5.0, 25.0);
        // 3 shares * 5 EUR = 15 EUR < 25 EUR minimum.
        assert_eq!(qty, 0.0);
        assert_eq!(pct, 0.0);
    }

    #[test]
    fn test_below_min_value_flips_verdict() {
        let mut c = candidate(100.0, 102.0);
        c.price_eur = 1.0;
        c.current_price = 1.0;
        c.avg_cost = 0.9;
        let score = calculate_sell_score(
            &c,
            &view(),
            None,
            None,
            &SellWeights::default(),
            &SellSettings::default(),
            now_after(365),
        );
        assert!(!score.eligible);
        assert_eq!(
            score.block_reason.as_deref(),
            Some("Below minimum sell value")
        );
    }

    #[test]
    fn test_drawdown_score_steps() {
        struct TestCase {
            drawdown: f64,
            days: i64,
            expected: f64,
        }

        let cases = vec![
            TestCase {
                drawdown: -0.30,
                days: 10,
                expected: 1.0,
            },
            TestCase {
                drawdown: -0.20,
                days: 200,
                expected: 0.9,
            },
            TestCase {
                drawdown: -0.20,
                days: 100,
                expected: 0.7,
            },
            TestCase {
                drawdown: -0.20,
                days: 30,
                expected: 0.5,
            },
            TestCase {
                drawdown: -0.12,
                days: 30,
                expected: 0.3,
            },
            TestCase {
                drawdown: -0.05,
                days: 30,
                expected: 0.1,
            },
        ];

        for test in &cases {
            let actual = drawdown_score(Some(&DrawdownStats {
                current_drawdown: test.drawdown,
                days_in_drawdown: test.days,
            }));
            assert_relative_eq!(actual, test.expected);
        }

        assert_relative_eq!(drawdown_score(None), 0.3);
    }

    #[test]
    fn test_weights_normalize() {
        let weights = SellWeights {
            underperformance: 2.0,
            time_held: 1.0,
            portfolio_balance: 1.0,
            instability: 0.5,
            drawdown: 0.5,
        }
        .normalized();
        let sum = weights.underperformance
            + weights.time_held
            + weights.portfolio_balance
            + weights.instability
            + weights.drawdown;
        assert_relative_eq!(sum, 1.0);
        assert_relative_eq!(weights.underperformance, 0.4);
    }

    #[test]
    fn test_underperformance_band() {
        // Inside the 8-15% target band: low score.
        assert_relative_eq!(underperformance_score(0.10, 365), 0.15);
        // Mild underperformance: high score.
        assert!(underperformance_score(0.01, 365) >= 0.7);
        // Windfall: moderate trim signal.
        assert_relative_eq!(underperformance_score(0.25, 365), 0.45);
    }
}
