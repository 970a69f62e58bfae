//! Twelve Data Rate Source
//!
//! Uses the `currency_conversion` endpoint: one request (one API credit) per
//! pair per poll. See <https://twelvedata.com/docs#currency-conversion>.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::domain::{CurrencyPair, ExchangeRate, RateSource};
use crate::error::{Error, Result};

pub(super) const SOURCE_NAME: &str = "twelvedata";

/// Public Twelve Data API endpoint
pub const TWELVEDATA_DEFAULT_BASE_URL: &str = "https://api.twelvedata.com";

/// Per-request timeout, also used for connecting
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The free plan allows 800 credits a day, one credit per pair request,
/// which works out to one request per pair every two minutes.
const INTERVAL_PER_PAIR: Duration = Duration::from_secs(120);

// =============================================================================
// Response Types
// =============================================================================

/// Body of a `currency_conversion` response. Errors share the endpoint and
/// carry `status`, `code` and `message` instead of the rate fields.
#[derive(Debug, Deserialize)]
struct ConversionResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    rate: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
}

// =============================================================================
// Twelve Data Source
// =============================================================================

/// [`RateSource`] backed by the Twelve Data REST API
pub struct TwelveDataSource {
    api_key: Option<String>,
    base_url: String,
    client: Option<Client>,
    interval: Duration,
}

impl TwelveDataSource {
    /// Create an uninitialized source. The key is checked by `initialize`.
    pub fn new(api_key: Option<String>, base_url: &str) -> Self {
        Self {
            api_key: api_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: None,
            interval: INTERVAL_PER_PAIR,
        }
    }

    fn fetch_error(pair: &CurrencyPair, reason: impl Into<String>) -> Error {
        Error::fetch(pair, SOURCE_NAME, reason)
    }
}

impl std::fmt::Debug for TwelveDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwelveDataSource")
            .field("base_url", &self.base_url)
            .field("initialized", &self.client.is_some())
            .field("interval", &self.interval)
            .finish()
    }
}

#[async_trait]
impl RateSource for TwelveDataSource {
    async fn initialize(&mut self, pairs: &[CurrencyPair]) -> Result<()> {
        if self.api_key.is_none() {
            return Err(Error::Config(
                "No API key supplied for twelvedata source".to_string(),
            ));
        }
        if pairs.is_empty() {
            return Err(Error::Config(
                "twelvedata source needs at least one currency pair".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("forex-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        self.client = Some(client);
        self.interval = INTERVAL_PER_PAIR * pairs.len() as u32;

        debug!(
            pairs = pairs.len(),
            interval_secs = self.interval.as_secs(),
            "twelvedata source initialized"
        );
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }

    #[instrument(name = "TwelveDataFetch", skip(self), fields(pair = %pair))]
    async fn fetch_one(&self, pair: &CurrencyPair) -> Result<ExchangeRate> {
        let (client, api_key) = match (&self.client, &self.api_key) {
            (Some(client), Some(key)) => (client, key),
            _ => return Err(Self::fetch_error(pair, "source is not initialized")),
        };

        let url = format!("{}/currency_conversion", self.base_url);
        let symbol = pair.to_string();

        // The URL carries the API key, so transport errors drop it before
        // they reach the logs.
        let response = client
            .get(&url)
            .query(&[("symbol", symbol.as_str()), ("apikey", api_key.as_str())])
            .send()
            .await
            .map_err(|e| Self::fetch_error(pair, e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::fetch_error(pair, format!("HTTP status {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Self::fetch_error(pair, e.without_url().to_string()))?;

        let parsed: ConversionResponse = serde_json::from_str(&body)
            .map_err(|e| Self::fetch_error(pair, format!("Failed to parse response: {}", e)))?;

        if parsed.status.as_deref() == Some("error") {
            return Err(Self::fetch_error(
                pair,
                format!(
                    "API error {}: {}",
                    parsed.code.unwrap_or_default(),
                    parsed.message.unwrap_or_default()
                ),
            ));
        }

        let rate = parsed
            .rate
            .filter(|r| r.is_finite() && *r > 0.0)
            .ok_or_else(|| Self::fetch_error(pair, "response has no valid rate"))?;

        let observed_at = parsed
            .timestamp
            .filter(|ts| *ts > 0)
            .unwrap_or_else(|| Utc::now().timestamp());

        debug!(rate, observed_at, "Received rate from twelvedata");
        Ok(ExchangeRate::new(rate, observed_at))
    }
}
