//! Rate Source Adapters
//!
//! Provider implementations of the [`RateSource`] port, plus the catalog that
//! picks one by name at startup.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │                   RateSource (port trait)                        │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │                      TwelveDataSource                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use forex_exporter::adapters::{build_source, SourceSettings};
//!
//! let source = build_source(&settings)?;
//! scheduler.start(source, shutdown).await?;
//! ```

mod twelvedata;

pub use twelvedata::{TwelveDataSource, TWELVEDATA_DEFAULT_BASE_URL};

use crate::domain::RateSource;
use crate::error::{Error, Result};

/// Names accepted by [`build_source`]
pub const SOURCE_NAMES: &[&str] = &[twelvedata::SOURCE_NAME];

/// Provider selection and credentials
#[derive(Clone)]
pub struct SourceSettings {
    /// Catalog name of the source
    pub name: String,

    /// Provider API key, if the provider needs one
    pub api_key: Option<String>,

    /// Provider API base URL
    pub base_url: String,
}

impl std::fmt::Debug for SourceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSettings")
            .field("name", &self.name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Create the named rate source, uninitialized.
pub fn build_source(settings: &SourceSettings) -> Result<Box<dyn RateSource>> {
    match settings.name.as_str() {
        twelvedata::SOURCE_NAME => Ok(Box::new(TwelveDataSource::new(
            settings.api_key.clone(),
            &settings.base_url,
        ))),
        other => Err(Error::Config(format!(
            "Unknown rate source {:?}, expected one of: {}",
            other,
            SOURCE_NAMES.join(", ")
        ))),
    }
}
