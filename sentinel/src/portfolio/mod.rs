use crate::{config::Settings, currency::Currency, error::SentinelError};
use sentinel_broker::Broker;
use sentinel_instrument::{Ccy, Symbol};
use sentinel_store::{Store, position::PositionUpdate, security::Security, target::TargetKind};
use std::{collections::HashMap, sync::Arc};
use tracing::info;

pub mod position;

/// Tag bucket applied to securities with no geography/industry metadata.
pub const UNKNOWN_TAG: &str = "Unknown";

/// Current allocation fractions across three dimensions. Multi-tag securities split
/// their weight equally across tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocations {
    pub by_security: HashMap<Symbol, f64>,
    pub by_geography: HashMap<String, f64>,
    pub by_industry: HashMap<String, f64>,
}

/// Normalised target allocation fractions per dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetAllocations {
    pub geography: HashMap<String, f64>,
    pub industry: HashMap<String, f64>,
}

/// Signed deviation (current - target) per dimension; positive = overweight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetDeviations {
    pub geography: HashMap<String, f64>,
    pub industry: HashMap<String, f64>,
}

/// Portfolio-level state: broker mirroring, valuations, allocations and targets.
#[derive(Clone)]
pub struct Portfolio {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    currency: Currency,
    settings: Settings,
}

impl std::fmt::Debug for Portfolio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portfolio").finish_non_exhaustive()
    }
}

impl Portfolio {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        currency: Currency,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            broker,
            currency,
            settings,
        }
    }

    /// Mirror broker state into the store: positions (creating missing securities)
    /// and the full cash balance mapping.
    pub async fn sync(&self) -> Result<(), SentinelError> {
        let data = self.broker.get_portfolio().await?;

        for pos in &data.positions {
            if self.store.security(&pos.symbol).await?.is_none() {
                let mut security = Security::new(
                    pos.symbol.clone(),
                    pos.name.clone().unwrap_or_else(|| pos.symbol.to_string()),
                    pos.currency.clone(),
                );
                security.active = true;
                self.store.upsert_security(&security).await?;
            }

            self.store
                .upsert_position(&PositionUpdate {
                    symbol: pos.symbol.clone(),
                    quantity: Some(pos.quantity),
                    avg_cost: pos.avg_cost,
                    current_price: pos.current_price,
                    currency: Some(pos.currency.clone()),
                })
                .await?;
        }

        self.store.replace_cash_balances(&data.cash).await?;
        info!(
            positions = data.positions.len(),
            currencies = data.cash.len(),
            "portfolio synced from broker"
        );
        Ok(())
    }

    /// Total portfolio value in EUR: cash plus position values.
    pub async fn total_value(&self) -> Result<f64, SentinelError> {
        let mut total = self.total_cash_eur().await?;
        for pos in self.store.positions().await? {
            total += position::value_eur(
                &self.currency,
                pos.quantity,
                pos.price(),
                &pos.currency,
            )
            .await;
        }
        Ok(total)
    }

    pub async fn cash_balances(&self) -> Result<HashMap<Ccy, f64>, SentinelError> {
        Ok(self.store.cash_balances().await?)
    }

    pub async fn total_cash_eur(&self) -> Result<f64, SentinelError> {
        let mut total = 0.0;
        for (currency, amount) in self.store.cash_balances().await? {
            total += self.currency.to_eur(amount, &currency).await;
        }
        Ok(total)
    }

    /// Current allocation fractions by security, geography and industry.
    pub async fn allocations(&self) -> Result<Allocations, SentinelError> {
        let positions = self.store.positions().await?;
        let total = self.total_value().await?;

        let mut allocations = Allocations::default();
        if total == 0.0 {
            return Ok(allocations);
        }

        let securities = self.store.securities(false).await?;
        let securities_map: HashMap<&Symbol, &Security> =
            securities.iter().map(|s| (&s.symbol, s)).collect();

        for pos in &positions {
            let value_eur = position::value_eur(
                &self.currency,
                pos.quantity,
                pos.price(),
                &pos.currency,
            )
            .await;
            let pct = position::allocation_pct(value_eur, total);
            allocations.by_security.insert(pos.symbol.clone(), pct);

            let Some(security) = securities_map.get(&pos.symbol) else {
                continue;
            };

            let mut geos = security.geographies();
            if geos.is_empty() {
                geos.push(UNKNOWN_TAG.to_string());
            }
            let geo_weight = pct / geos.len() as f64;
            for geo in geos {
                *allocations.by_geography.entry(geo).or_insert(0.0) += geo_weight;
            }

            let mut inds = security.industries();
            if inds.is_empty() {
                inds.push(UNKNOWN_TAG.to_string());
            }
            let ind_weight = pct / inds.len() as f64;
            for ind in inds {
                *allocations.by_industry.entry(ind).or_insert(0.0) += ind_weight;
            }
        }

        Ok(allocations)
    }

    /// Target allocation fractions, normalised per dimension at read time. A
    /// dimension whose weights sum to zero comes back empty and is skipped by
    /// downstream scoring.
    pub async fn target_allocations(&self) -> Result<TargetAllocations, SentinelError> {
        let targets = self.store.allocation_targets().await?;

        let mut geography = HashMap::new();
        let mut industry = HashMap::new();
        for target in targets {
            match target.kind {
                TargetKind::Geography => {
                    geography.insert(target.name, target.weight);
                }
                TargetKind::Industry => {
                    industry.insert(target.name, target.weight);
                }
            }
        }

        Ok(TargetAllocations {
            geography: sentinel_store::target::normalize_weights(&geography),
            industry: sentinel_store::target::normalize_weights(&industry),
        })
    }

    /// Signed deviation from targets (positive = overweight).
    pub async fn deviation_from_targets(&self) -> Result<TargetDeviations, SentinelError> {
        let current = self.allocations().await?;
        let targets = self.target_allocations().await?;

        let geography = targets
            .geography
            .iter()
            .map(|(name, target)| {
                let current_pct = current.by_geography.get(name).copied().unwrap_or(0.0);
                (name.clone(), current_pct - target)
            })
            .collect();
        let industry = targets
            .industry
            .iter()
            .map(|(name, target)| {
                let current_pct = current.by_industry.get(name).copied().unwrap_or(0.0);
                (name.clone(), current_pct - target)
            })
            .collect();

        Ok(TargetDeviations {
            geography,
            industry,
        })
    }

    /// Whether any dimension deviates beyond the configured rebalance threshold.
    pub async fn needs_rebalance(&self) -> Result<bool, SentinelError> {
        let threshold = self.settings.get_f64("rebalance_threshold", 0.05).await;
        let deviations = self.deviation_from_targets().await?;

        Ok(deviations
            .geography
            .values()
            .chain(deviations.industry.values())
            .any(|deviation| deviation.abs() > threshold))
    }
}
