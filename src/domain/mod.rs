//! Domain Layer
//!
//! Value objects and ports shared by the scheduler, the metric registry and
//! the rate source adapters.
//!
//! - **Ports** (`ports.rs`) - the [`RateSource`] abstraction and the
//!   [`CurrencyPair`] / [`ExchangeRate`] value objects it trades in
//!
//! # Usage
//!
//! ```ignore
//! use forex_exporter::domain::{CurrencyPair, RateSource};
//!
//! async fn poll_once<S: RateSource>(source: &S, pair: &CurrencyPair) -> Result<f64> {
//!     let rate = source.fetch_one(pair).await?;
//!     Ok(rate.rate)
//! }
//! ```

pub mod ports;

// Re-export commonly used types
pub use ports::{CurrencyPair, ExchangeRate, RateSource};
