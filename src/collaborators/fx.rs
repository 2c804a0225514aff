//! FX rate lookup with an injected TTL cache.
//!
//! Deposits arrive in arbitrary currencies and settle in one; the rate
//! service is consulted at record time. The cache is owned by whoever
//! constructs it, never a module global.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::{CoreError, Result};

/// Source of exchange rates into the settlement currency.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Units of the settlement currency per one unit of `currency`.
    async fn lookup_fx_rate(&self, currency: &str) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct RateResponse {
    rate: f64,
}

/// Rate lookup against an HTTP rate service, with exponential backoff and
/// jitter on connection-level failures.
pub struct HttpRateProvider {
    client: reqwest::Client,
    base_url: String,
    settlement_currency: String,
}

impl HttpRateProvider {
    pub fn new(base_url: String, settlement_currency: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            settlement_currency,
        }
    }

    async fn fetch(&self, currency: &str) -> Result<f64> {
        let url = format!(
            "{}/rates/{}/{}",
            self.base_url, currency, self.settlement_currency
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::ServiceUnavailable(format!("rate service: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::Api(format!(
                "rate service returned {} for {currency}",
                response.status()
            )));
        }
        let body: RateResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Api(format!("rate service payload: {e}")))?;
        if body.rate <= 0.0 || !body.rate.is_finite() {
            return Err(CoreError::Api(format!(
                "rate service returned unusable rate {} for {currency}",
                body.rate
            )));
        }
        Ok(body.rate)
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn lookup_fx_rate(&self, currency: &str) -> Result<f64> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(3)
            .with_jitter();
        (|| self.fetch(currency))
            .retry(backoff)
            .when(|e| matches!(e, CoreError::ServiceUnavailable(_)))
            .await
    }
}

/// Fixed rate table for tests and standalone runs.
#[derive(Debug, Default)]
pub struct FixedRateProvider {
    rates: HashMap<String, f64>,
}

impl FixedRateProvider {
    pub fn new(rates: HashMap<String, f64>) -> Self {
        Self { rates }
    }

    pub fn single(currency: &str, rate: f64) -> Self {
        Self {
            rates: HashMap::from([(currency.to_string(), rate)]),
        }
    }
}

#[async_trait]
impl RateProvider for FixedRateProvider {
    async fn lookup_fx_rate(&self, currency: &str) -> Result<f64> {
        self.rates
            .get(currency)
            .copied()
            .ok_or_else(|| CoreError::Api(format!("no rate for {currency}")))
    }
}

struct CachedRate {
    rate: f64,
    fetched_at: Instant,
}

/// TTL cache in front of a rate provider.
pub struct FxRateCache {
    provider: Box<dyn RateProvider>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedRate>>,
}

impl FxRateCache {
    pub fn new(provider: Box<dyn RateProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached rate, refreshed when stale or when `force_refresh` is set.
    pub async fn rate(&self, currency: &str, force_refresh: bool) -> Result<f64> {
        if !force_refresh {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(currency) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.rate);
                }
            }
        }

        let rate = self.provider.lookup_fx_rate(currency).await?;
        debug!(currency, rate, "fx rate refreshed");
        let mut entries = self.entries.write().await;
        entries.insert(
            currency.to_string(),
            CachedRate {
                rate,
                fetched_at: Instant::now(),
            },
        );
        Ok(rate)
    }
}

/// Convert a minor-unit amount at `rate`, rounding to the nearest minor
/// unit of the settlement currency.
pub fn convert_minor(amount_minor: i64, rate: f64) -> i64 {
    (amount_minor as f64 * rate).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RateProvider for CountingProvider {
        async fn lookup_fx_rate(&self, _currency: &str) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(1.25)
        }
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups_without_refetching() {
        let cache = FxRateCache::new(
            Box::new(CountingProvider {
                calls: AtomicU32::new(0),
            }),
            Duration::from_secs(300),
        );
        assert_eq!(cache.rate("EUR", false).await.unwrap(), 1.25);
        assert_eq!(cache.rate("EUR", false).await.unwrap(), 1.25);

        let inner = cache.entries.read().await;
        assert_eq!(inner.len(), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_the_cache() {
        let provider = Box::new(CountingProvider {
            calls: AtomicU32::new(0),
        });
        let cache = FxRateCache::new(provider, Duration::from_secs(300));
        cache.rate("EUR", false).await.unwrap();
        cache.rate("EUR", true).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_currency_is_an_api_error() {
        let provider = FixedRateProvider::single("EUR", 1.1);
        let err = provider.lookup_fx_rate("GBP").await.unwrap_err();
        assert!(matches!(err, CoreError::Api(_)));
    }

    #[test]
    fn conversion_rounds_to_nearest_minor_unit() {
        assert_eq!(convert_minor(10_000, 1.0), 10_000);
        assert_eq!(convert_minor(10_000, 1.2345), 12_345);
        assert_eq!(convert_minor(3, 0.5), 2);
        assert_eq!(convert_minor(1, 0.4), 0);
    }
}
