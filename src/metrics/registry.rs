//! Metric Registry
//!
//! Last-known exchange rate and observation time per
//! (source currency, target currency, provider). Values are overwritten in
//! place; nothing is kept beyond the latest successful fetch.

use std::collections::HashMap;

use parking_lot::RwLock;
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::domain::{CurrencyPair, ExchangeRate};
use crate::error::Result;

/// Prefix of every exported metric name
pub const METRICS_NAMESPACE: &str = "forex_exporter";

const PAIR_LABELS: &[&str] = &["source_currency", "target_currency", "provider"];

type EntryKey = (CurrencyPair, String);

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    rate: f64,
    observed_at: i64,
}

/// Thread-safe store of the latest rate per pair and provider.
///
/// Owns its own Prometheus [`Registry`], so several instances can live in one
/// process (tests do this).
pub struct ForexMetrics {
    registry: Registry,
    exchange_rate: GaugeVec,
    exchange_rate_timestamp: GaugeVec,
    fetch_errors: IntCounterVec,
    server_restarts: IntCounter,

    /// Guards the gauge writes as well as the entries, so a render never
    /// interleaves with a half-applied `record`.
    entries: RwLock<HashMap<EntryKey, Entry>>,
}

impl ForexMetrics {
    /// Create the registry and register every metric family.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let exchange_rate = GaugeVec::new(
            Opts::new(
                "exchange_rate",
                "Record the exchange rate between a currency pair",
            )
            .namespace(METRICS_NAMESPACE),
            PAIR_LABELS,
        )?;

        let exchange_rate_timestamp = GaugeVec::new(
            Opts::new(
                "exchange_rate_timestamp_seconds",
                "Unix time at which the provider observed the exchange rate",
            )
            .namespace(METRICS_NAMESPACE),
            PAIR_LABELS,
        )?;

        let fetch_errors = IntCounterVec::new(
            Opts::new(
                "fetch_errors_total",
                "Failed attempts to fetch the exchange rate of a currency pair",
            )
            .namespace(METRICS_NAMESPACE),
            PAIR_LABELS,
        )?;

        let server_restarts = IntCounter::with_opts(
            Opts::new(
                "metrics_server_restarts_total",
                "Automatic restarts of the metrics HTTP listener",
            )
            .namespace(METRICS_NAMESPACE),
        )?;

        registry.register(Box::new(exchange_rate.clone()))?;
        registry.register(Box::new(exchange_rate_timestamp.clone()))?;
        registry.register(Box::new(fetch_errors.clone()))?;
        registry.register(Box::new(server_restarts.clone()))?;

        Ok(Self {
            registry,
            exchange_rate,
            exchange_rate_timestamp,
            fetch_errors,
            server_restarts,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Set the latest rate for a pair.
    pub fn set_rate(&self, pair: &CurrencyPair, provider: &str, rate: f64) {
        let mut entries = self.entries.write();
        self.exchange_rate
            .with_label_values(&label_values(pair, provider))
            .set(rate);
        entries
            .entry((pair.clone(), provider.to_string()))
            .or_default()
            .rate = rate;
    }

    /// Set the observation time (unix seconds) of the latest rate for a pair.
    pub fn set_timestamp(&self, pair: &CurrencyPair, provider: &str, timestamp: i64) {
        let mut entries = self.entries.write();
        self.exchange_rate_timestamp
            .with_label_values(&label_values(pair, provider))
            .set(timestamp as f64);
        entries
            .entry((pair.clone(), provider.to_string()))
            .or_default()
            .observed_at = timestamp;
    }

    /// Store a fetched rate, replacing whatever was held for the pair.
    pub fn record(&self, pair: &CurrencyPair, provider: &str, rate: &ExchangeRate) {
        let mut entries = self.entries.write();
        let labels = label_values(pair, provider);

        self.exchange_rate.with_label_values(&labels).set(rate.rate);
        self.exchange_rate_timestamp
            .with_label_values(&labels)
            .set(rate.observed_at as f64);

        entries.insert(
            (pair.clone(), provider.to_string()),
            Entry {
                rate: rate.rate,
                observed_at: rate.observed_at,
            },
        );
    }

    /// Last stored rate for a pair, `None` if it was never fetched.
    pub fn latest(&self, pair: &CurrencyPair, provider: &str) -> Option<ExchangeRate> {
        self.entries
            .read()
            .get(&(pair.clone(), provider.to_string()))
            .map(|e| ExchangeRate::new(e.rate, e.observed_at))
    }

    /// Number of pairs with a stored rate.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count a failed fetch for a pair.
    pub fn record_fetch_error(&self, pair: &CurrencyPair, provider: &str) {
        self.fetch_errors
            .with_label_values(&label_values(pair, provider))
            .inc();
    }

    /// Count an automatic metrics server restart.
    pub fn record_server_restart(&self) {
        self.server_restarts.inc();
    }

    /// Total automatic metrics server restarts so far.
    pub fn server_restarts(&self) -> u64 {
        self.server_restarts.get()
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let families = {
            let _entries = self.entries.read();
            self.registry.gather()
        };

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Content type of [`render`](Self::render) output.
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

impl std::fmt::Debug for ForexMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForexMetrics")
            .field("entries", &self.len())
            .finish()
    }
}

fn label_values<'a>(pair: &'a CurrencyPair, provider: &'a str) -> [&'a str; 3] {
    [pair.source(), pair.target(), provider]
}
