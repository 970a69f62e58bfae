//! Metrics module
//!
//! Holds the last-known exchange rates as Prometheus gauges and renders them
//! for scraping.

mod registry;

pub use registry::{ForexMetrics, METRICS_NAMESPACE};
