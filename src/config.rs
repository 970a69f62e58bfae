//! Configuration
//!
//! Every setting is a CLI flag backed by an environment variable. Values are
//! validated once at startup into an [`ExporterConfig`] that is handed to each
//! component's constructor.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use clap::Parser;

use crate::adapters::SourceSettings;
use crate::domain::CurrencyPair;
use crate::error::{Error, Result};

/// Default host the metrics server listens on
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Default metrics server port
pub const DEFAULT_LISTEN_PORT: u16 = 9299;

/// Highest accepted listen port
pub const MAX_LISTEN_PORT: u16 = 32767;

/// Time allowed for in-flight work to finish during shutdown
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

// =============================================================================
// CLI Arguments
// =============================================================================

/// Forex Exporter - exchange rates as Prometheus metrics
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Comma-separated currency pairs, e.g. "USD/EUR,GBP/JPY"
    #[arg(long, env = "FOREX_EXPORTER_CURRENCY_PAIRS", default_value = "")]
    pub currency_pairs: String,

    /// Rate source to poll
    #[arg(long, env = "FOREX_EXPORTER_SOURCE", default_value = "twelvedata")]
    pub source: String,

    /// Twelve Data API key
    #[arg(long, env = "FOREX_EXPORTER_TWELVEDATA_API_KEY", hide_env_values = true)]
    pub twelvedata_api_key: Option<String>,

    /// Twelve Data API base URL
    #[arg(
        long,
        env = "FOREX_EXPORTER_TWELVEDATA_BASE_URL",
        default_value = "https://api.twelvedata.com"
    )]
    pub twelvedata_base_url: String,

    /// Metrics server listen address (host:port)
    #[arg(long, env = "FOREX_EXPORTER_LISTEN", default_value = "0.0.0.0:9299")]
    pub listen: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    /// Validate the raw arguments into an [`ExporterConfig`].
    pub fn into_config(self) -> Result<ExporterConfig> {
        let currency_pairs = parse_currency_pairs(&self.currency_pairs)?;
        let listen = ListenAddr::parse(&self.listen)?;

        Ok(ExporterConfig {
            currency_pairs,
            listen,
            source: SourceSettings {
                name: self.source.trim().to_ascii_lowercase(),
                api_key: self.twelvedata_api_key,
                base_url: self.twelvedata_base_url,
            },
            grace_period: SHUTDOWN_GRACE_PERIOD,
        })
    }
}

// =============================================================================
// Validated Configuration
// =============================================================================

/// Validated exporter configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Pairs to poll, in configured order
    pub currency_pairs: Vec<CurrencyPair>,

    /// Metrics server address
    pub listen: ListenAddr,

    /// Rate source selection and credentials
    pub source: SourceSettings,

    /// Shutdown grace period
    pub grace_period: Duration,
}

/// Parse a comma-separated `XXX/YYY` list, preserving input order.
///
/// A pair listed twice is rejected; each pair is polled once per tick.
pub fn parse_currency_pairs(raw: &str) -> Result<Vec<CurrencyPair>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Config(
            "No currency pairs supplied in FOREX_EXPORTER_CURRENCY_PAIRS".to_string(),
        ));
    }

    let pairs: Vec<CurrencyPair> = raw.split(',').map(str::parse).collect::<Result<_>>()?;

    let mut seen = HashSet::with_capacity(pairs.len());
    if let Some(dup) = pairs.iter().find(|pair| !seen.insert(*pair)) {
        return Err(Error::Config(format!("Duplicate currency pair: {}", dup)));
    }

    Ok(pairs)
}

/// A validated `host:port` listen address.
///
/// The host is kept as text so hostnames resolve at bind time. An empty host
/// means all interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl ListenAddr {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("Invalid listen host port: {}", raw)))?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| Error::Config(format!("Invalid listen host: {}", host)))?,
            None if host.contains(':') => {
                return Err(Error::Config(format!(
                    "IPv6 listen host must be bracketed: {}",
                    raw
                )))
            }
            None => host,
        };

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| (1..=MAX_LISTEN_PORT).contains(p))
            .ok_or_else(|| Error::Config(format!("Invalid port: {}", port)))?;

        let host = if host.is_empty() {
            DEFAULT_LISTEN_HOST.to_string()
        } else {
            host.to_string()
        };

        Ok(Self { host, port })
    }
}

impl Default for ListenAddr {
    fn default() -> Self {
        Self {
            host: DEFAULT_LISTEN_HOST.to_string(),
            port: DEFAULT_LISTEN_PORT,
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
