use chrono::NaiveDate;
use parking_lot::RwLock;
use sentinel_broker::{Broker, fx};
use sentinel_instrument::Ccy;
use sentinel_store::Store;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

const RATES_CACHE_KEY: &str = "currency:rates";
const RATES_SETTING_KEY: &str = "exchange_rates";
const RATES_TTL_SECONDS: i64 = 7_200;

/// Currency converter with EUR as the pivot.
///
/// Current rates (1 unit = X EUR) are cached in memory and in the store's TTL cache
/// for two hours; per-date rates live in the FX history table for snapshot
/// reconstruction. Failures fall back to the most recent cached rates, then to a
/// fixed defaults table. An unknown currency converts at 1.0 (logged).
#[derive(Clone)]
pub struct Currency {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    rates: Arc<RwLock<Option<HashMap<Ccy, f64>>>>,
}

impl std::fmt::Debug for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Currency").finish_non_exhaustive()
    }
}

impl Currency {
    pub fn new(store: Arc<dyn Store>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            rates: Arc::new(RwLock::new(None)),
        }
    }

    fn default_rates() -> HashMap<Ccy, f64> {
        fx::DEFAULT_RATES
            .iter()
            .map(|(code, rate)| (Ccy::new(*code), *rate))
            .collect()
    }

    /// Fetch current rates from the broker and persist them. On failure, returns
    /// whatever [`Self::rates`] can resolve.
    pub async fn sync_rates(&self) -> HashMap<Ccy, f64> {
        let currencies: Vec<Ccy> = fx::RATE_FETCH_CURRENCIES
            .iter()
            .map(|code| Ccy::new(*code))
            .collect();

        match self.broker.eur_cross_rates(&currencies, None).await {
            Ok(raw) if !raw.is_empty() => {
                // Broker returns 1 EUR = X ccy; we keep 1 ccy = X EUR.
                let mut rates: HashMap<Ccy, f64> = raw
                    .into_iter()
                    .filter(|(_, rate)| *rate > 0.0)
                    .map(|(currency, rate)| (currency, 1.0 / rate))
                    .collect();
                rates.insert(Ccy::EUR, 1.0);

                if let Ok(document) = serde_json::to_string(&rates) {
                    if let Err(error) = self.store.set_setting(RATES_SETTING_KEY, &document).await
                    {
                        warn!(%error, "failed to persist exchange rates");
                    }
                    if let Err(error) = self
                        .store
                        .cache_set(RATES_CACHE_KEY, &document, RATES_TTL_SECONDS)
                        .await
                    {
                        warn!(%error, "failed to cache exchange rates");
                    }
                }

                *self.rates.write() = Some(rates.clone());
                rates
            }
            Ok(_) | Err(_) => {
                debug!("rate fetch failed, falling back to cached rates");
                self.rates().await
            }
        }
    }

    /// Current rates to EUR: memory, then store cache, then the persisted setting,
    /// then fixed defaults.
    pub async fn rates(&self) -> HashMap<Ccy, f64> {
        if let Some(rates) = self.rates.read().clone() {
            return rates;
        }

        if let Ok(Some(document)) = self.store.cache_get(RATES_CACHE_KEY).await {
            if let Ok(rates) = serde_json::from_str::<HashMap<Ccy, f64>>(&document) {
                *self.rates.write() = Some(rates.clone());
                return rates;
            }
        }

        if let Ok(Some(document)) = self.store.setting(RATES_SETTING_KEY).await {
            if let Ok(rates) = serde_json::from_str::<HashMap<Ccy, f64>>(&document) {
                if let Err(error) = self
                    .store
                    .cache_set(RATES_CACHE_KEY, &document, RATES_TTL_SECONDS)
                    .await
                {
                    debug!(%error, "failed to re-cache stored rates");
                }
                *self.rates.write() = Some(rates.clone());
                return rates;
            }
        }

        let defaults = Self::default_rates();
        *self.rates.write() = Some(defaults.clone());
        defaults
    }

    /// Rate to EUR for one currency. Unknown currencies resolve to 1.0.
    pub async fn rate(&self, currency: &Ccy) -> f64 {
        if currency.is_eur() {
            return 1.0;
        }
        match self.rates().await.get(currency) {
            Some(rate) => *rate,
            None => {
                debug!(%currency, "unknown currency, assuming rate 1.0");
                1.0
            }
        }
    }

    pub async fn to_eur(&self, amount: f64, currency: &Ccy) -> f64 {
        if currency.is_eur() {
            return amount;
        }
        amount * self.rate(currency).await
    }

    pub async fn from_eur(&self, amount: f64, currency: &Ccy) -> f64 {
        if currency.is_eur() {
            return amount;
        }
        let rate = self.rate(currency).await;
        if rate > 0.0 { amount / rate } else { amount }
    }

    /// Cross-rate conversion composed through EUR:
    /// `rate(a->b) = rate(a->EUR) / rate(b->EUR)`.
    pub async fn convert(&self, amount: f64, from: &Ccy, to: &Ccy) -> f64 {
        if from == to {
            return amount;
        }
        self.from_eur(self.to_eur(amount, from).await, to).await
    }

    /// Manually pin a rate (1 unit = `rate` EUR) and persist the updated table.
    pub async fn set_rate(&self, currency: Ccy, rate: f64) {
        let mut rates = self.rates().await;
        rates.insert(currency, rate);
        if let Ok(document) = serde_json::to_string(&rates) {
            if let Err(error) = self.store.set_setting(RATES_SETTING_KEY, &document).await {
                warn!(%error, "failed to persist pinned rate");
            }
        }
        *self.rates.write() = Some(rates);
    }

    pub fn clear_cache(&self) {
        *self.rates.write() = None;
    }

    /// Rate to EUR for a specific date. Consults the per-date FX table first; on a
    /// miss fetches from the broker and upserts; on failure falls back to the
    /// current rate.
    pub async fn rate_for_date(&self, currency: &Ccy, date: NaiveDate) -> f64 {
        if currency.is_eur() {
            return 1.0;
        }

        match self.store.fx_rate_for_date(date, currency).await {
            Ok(Some(rate)) => return rate,
            Ok(None) => {}
            Err(error) => debug!(%error, %currency, %date, "fx history read failed"),
        }

        if let Ok(raw) = self
            .broker
            .eur_cross_rates(std::slice::from_ref(currency), Some(date))
            .await
        {
            if let Some(rate) = raw.get(currency).filter(|rate| **rate > 0.0) {
                let inverted = 1.0 / rate;
                if let Err(error) = self.store.save_fx_rate(date, currency, inverted).await {
                    warn!(%error, %currency, %date, "failed to cache historical rate");
                }
                return inverted;
            }
        }

        self.rate(currency).await
    }

    pub async fn to_eur_for_date(&self, amount: f64, currency: &Ccy, date: NaiveDate) -> f64 {
        if currency.is_eur() {
            return amount;
        }
        amount * self.rate_for_date(currency, date).await
    }

    /// Prefetch per-date rates for snapshot reconstruction: one broker request per
    /// missing date covering all requested currencies.
    pub async fn prefetch(&self, currencies: &[Ccy], dates: &[NaiveDate]) {
        let currencies: Vec<Ccy> = currencies
            .iter()
            .filter(|currency| !currency.is_eur())
            .cloned()
            .collect();
        if currencies.is_empty() {
            return;
        }

        let mut missing_dates = Vec::new();
        for date in dates {
            for currency in &currencies {
                match self.store.fx_rate_for_date(*date, currency).await {
                    Ok(Some(_)) => {}
                    _ => {
                        missing_dates.push(*date);
                        break;
                    }
                }
            }
        }
        missing_dates.sort_unstable();
        missing_dates.dedup();

        for date in missing_dates {
            match self.broker.eur_cross_rates(&currencies, Some(date)).await {
                Ok(raw) => {
                    for (currency, rate) in raw {
                        if rate > 0.0 {
                            if let Err(error) =
                                self.store.save_fx_rate(date, &currency, 1.0 / rate).await
                            {
                                warn!(%error, %currency, %date, "failed to cache prefetched rate");
                            }
                        }
                    }
                }
                Err(error) => warn!(%error, %date, "failed to prefetch rates"),
            }
        }
    }
}
