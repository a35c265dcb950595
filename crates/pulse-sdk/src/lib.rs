//! The Pulse SDK facade.
//!
//! Assembles the core subsystems (event hub, rules engine, datastore,
//! rules downloader, and privacy gating) into one explicit [`Runtime`]
//! value. Applications construct a runtime at startup from a [`Config`]
//! and thread it through; nothing in the workspace is a process-wide
//! singleton.
//!
//! ```rust,ignore
//! let config = pulse_sdk::load_config(Some("pulse.toml"))?;
//! pulse_sdk::init_logging(&config.logging);
//!
//! let runtime = Runtime::new(config).await?;
//! runtime.register_extension(|| Box::new(MyExtension::default())).await?;
//! runtime.start();
//! runtime.dispatch(Event::new("launch", EventType::Lifecycle, EventSource::RequestContent))?;
//! ```

mod config;
mod error;
mod privacy;
mod runtime;

pub use config::{load_config, Config, ConfigError, LoggingConfig, RulesConfig, StorageConfig};
pub use error::SdkError;
pub use runtime::Runtime;

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber from logging config.
///
/// Safe to call more than once; later calls are no-ops. Only the facade
/// installs a subscriber; library crates just emit.
pub fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
