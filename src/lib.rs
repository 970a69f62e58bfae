//! Forex Exporter
//!
//! Periodically retrieves foreign-exchange rates for a configured set of
//! currency pairs and republishes the latest value of each pair as Prometheus
//! metrics.
//!
//! # Architecture
//!
//! ```text
//! Poll Scheduler → Rate Source → Metric Registry ← Metrics Server ← scrape
//!        ▲                                               ▲
//!        └──────────── Shutdown Coordinator ─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Rate source implementations and the source catalog
//! - [`config`] - CLI/environment configuration and validation
//! - [`domain`] - Currency pairs, exchange rates and the rate source port
//! - [`error`] - Error types
//! - [`metrics`] - Last-known rates as Prometheus gauges
//! - [`scheduler`] - Periodic per-pair polling
//! - [`server`] - Self-restarting `/metrics` HTTP server
//! - [`shutdown`] - Signal handling and bounded subsystem join

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Args, ExporterConfig, ListenAddr};
pub use domain::{CurrencyPair, ExchangeRate, RateSource};
pub use error::{Error, Result};
pub use metrics::ForexMetrics;
pub use scheduler::PollScheduler;
pub use server::MetricsServer;
pub use shutdown::ShutdownCoordinator;
