//! Domain Ports
//!
//! The scheduler only knows rate providers through the [`RateSource`] trait.
//! Provider adapters implement it; tests implement it with scripted sources.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │   CurrencyPair │ ExchangeRate │ RateSource (port)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │   TwelveDataSource │ (future providers)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// An ordered (source, target) currency pair, e.g. `USD/EUR`.
///
/// Both codes are exactly three ASCII letters and stored upper-cased.
/// Construct through [`CurrencyPair::new`] or [`str::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CurrencyPair {
    source: String,
    target: String,
}

impl CurrencyPair {
    /// Create a validated pair.
    pub fn new(source: &str, target: &str) -> Result<Self> {
        Ok(Self {
            source: normalize_code(source)?,
            target: normalize_code(target)?,
        })
    }

    /// Source (base) currency code.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Target (quote) currency code.
    pub fn target(&self) -> &str {
        &self.target
    }
}

fn normalize_code(code: &str) -> Result<String> {
    let code = code.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(Error::Config(format!("Invalid currency code: {:?}", code)));
    }
    Ok(code.to_ascii_uppercase())
}

impl FromStr for CurrencyPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(source), Some(target), None) => Self::new(source, target),
            _ => Err(Error::Config(format!("Invalid currency pair: {:?}", s))),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.target)
    }
}

/// One observed exchange rate.
///
/// Each successful fetch produces a fresh value that replaces the previous
/// one for its pair; values are never merged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangeRate {
    /// Units of target currency per unit of source currency
    pub rate: f64,
    /// Observation time as unix seconds
    pub observed_at: i64,
}

impl ExchangeRate {
    pub fn new(rate: f64, observed_at: i64) -> Self {
        Self { rate, observed_at }
    }
}

// =============================================================================
// Rate Source Port
// =============================================================================

/// Port for a foreign-exchange rate provider.
///
/// One implementation per provider. A process binds exactly one source at
/// startup; connection and credential state is established once in
/// [`initialize`](RateSource::initialize) and reused for every fetch.
///
/// # Example
///
/// ```ignore
/// struct FixedSource;
///
/// #[async_trait]
/// impl RateSource for FixedSource {
///     async fn initialize(&mut self, _pairs: &[CurrencyPair]) -> Result<()> { Ok(()) }
///     fn poll_interval(&self) -> Duration { Duration::from_secs(60) }
///     fn name(&self) -> &str { "fixed" }
///     async fn fetch_one(&self, _pair: &CurrencyPair) -> Result<ExchangeRate> {
///         Ok(ExchangeRate::new(1.0, 0))
///     }
/// }
/// ```
#[async_trait]
pub trait RateSource: Send + Sync {
    /// One-time setup for the configured pairs.
    ///
    /// Fails on missing credentials or a pair set the provider cannot serve.
    async fn initialize(&mut self, pairs: &[CurrencyPair]) -> Result<()>;

    /// Time between polling rounds. May depend on the number of pairs.
    fn poll_interval(&self) -> Duration;

    /// Provider identifier, used as a metric label.
    fn name(&self) -> &str;

    /// Fetch the current rate of one pair. Implementations apply their own
    /// network timeout.
    async fn fetch_one(&self, pair: &CurrencyPair) -> Result<ExchangeRate>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_pair_parse() {
        let pair: CurrencyPair = "USD/EUR".parse().unwrap();
        assert_eq!(pair.source(), "USD");
        assert_eq!(pair.target(), "EUR");
        assert_eq!(pair.to_string(), "USD/EUR");
    }

    #[test]
    fn test_pair_parse_normalizes() {
        let pair: CurrencyPair = "  gbp/Jpy ".parse().unwrap();
        assert_eq!(pair, CurrencyPair::new("GBP", "JPY").unwrap());
    }

    #[test]
    fn test_pair_parse_rejects_malformed() {
        for raw in ["US/EUR", "123/EUR", "USD-EUR", "USD/EUR/GBP", "USD/", "", "USDD/EUR"] {
            assert_matches!(raw.parse::<CurrencyPair>(), Err(Error::Config(_)), "{raw}");
        }
    }

    #[test]
    fn test_pair_rejects_non_ascii_letters() {
        assert!(CurrencyPair::new("ÄBC", "EUR").is_err());
        assert!(CurrencyPair::new("U$D", "EUR").is_err());
    }

    #[test]
    fn test_pair_equality_by_value() {
        let a = CurrencyPair::new("USD", "EUR").unwrap();
        let b = CurrencyPair::new("usd", "eur").unwrap();
        let reversed = CurrencyPair::new("EUR", "USD").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, reversed);
    }

    #[test]
    fn test_exchange_rate_new() {
        let rate = ExchangeRate::new(0.92, 1_700_000_000);
        assert_eq!(rate.rate, 0.92);
        assert_eq!(rate.observed_at, 1_700_000_000);
    }
}
