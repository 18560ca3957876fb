use sentinel_store::Store;
use std::sync::Arc;
use tracing::debug;

/// Recognised settings keys with their defaults, seeded at startup without
/// overwriting user values.
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("min_hold_days", "90"),
    ("sell_cooldown_days", "180"),
    ("max_loss_threshold", "-0.20"),
    ("min_sell_value", "25"),
    ("min_trade_value", "100"),
    ("trade_cooloff_days", "30"),
    ("transaction_fee_fixed", "2.0"),
    ("transaction_fee_percent", "0.2"),
    ("max_position_pct", "20"),
    ("min_position_pct", "2"),
    ("target_cash_pct", "5"),
    ("diversification_impact_pct", "10"),
    ("max_dividend_reinvestment_boost", "0.15"),
    ("rebalance_threshold", "0.05"),
    ("ml_service_base_url", "http://localhost:8001"),
    ("trading_mode", "research"),
];

/// Typed view over the store's key/value settings table.
///
/// Getters never fail: a missing key, store error, or unparseable value yields the
/// supplied default (logged at debug).
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings").finish_non_exhaustive()
    }
}

impl Settings {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Seed every recognised key that is not already present.
    pub async fn init_defaults(&self) -> Result<(), sentinel_store::error::StoreError> {
        for (key, value) in DEFAULT_SETTINGS {
            if self.store.setting(key).await?.is_none() {
                self.store.set_setting(key, value).await?;
            }
        }
        Ok(())
    }

    pub async fn get_raw(&self, key: &str) -> Option<String> {
        match self.store.setting(key).await {
            Ok(value) => value,
            Err(error) => {
                debug!(key, %error, "settings read failed, using default");
                None
            }
        }
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get_raw(key)
            .await
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get_raw(key)
            .await
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }

    pub async fn get_str(&self, key: &str, default: &str) -> String {
        self.get_raw(key).await.unwrap_or_else(|| default.to_string())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), sentinel_store::error::StoreError> {
        self.store.set_setting(key, value).await
    }
}
