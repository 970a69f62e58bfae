//! Error types for the forex exporter

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the forex exporter
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Startup Errors
    // =========================================================================
    /// Invalid or missing configuration (currency pairs, credentials, listen address)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The metrics listener could not be bound at startup
    #[error("Failed to bind metrics server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Rate Source Errors
    // =========================================================================
    /// Fetching one pair from a rate source failed
    #[error("Failed to fetch {pair} from {provider}: {reason}")]
    Fetch {
        pair: String,
        provider: String,
        reason: String,
    },

    // =========================================================================
    // Metrics Server Errors
    // =========================================================================
    /// The listener loop stopped with an error after starting
    #[error("Metrics server error: {0}")]
    Serve(String),

    /// Too many listener restarts inside the restart window
    #[error("Metrics server restarted {restarts} times within the restart window, last error: {last_error}")]
    RestartBudgetExhausted { restarts: u32, last_error: String },

    /// Metrics could not be encoded
    #[error("Failed to render metrics: {0}")]
    Render(#[from] prometheus::Error),

    // =========================================================================
    // Shutdown Errors
    // =========================================================================
    /// Graceful shutdown did not finish inside the grace period
    #[error("{component} did not shut down within {grace:?}")]
    ShutdownTimeout {
        component: String,
        grace: Duration,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a fetch error for a pair and provider
    pub fn fetch(pair: impl ToString, provider: &str, reason: impl Into<String>) -> Self {
        Error::Fetch {
            pair: pair.to_string(),
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that are fatal at startup
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Bind { .. })
    }
}
