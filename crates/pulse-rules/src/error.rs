//! Error types for the rules pipeline.

/// Errors that can occur while loading or applying rules.
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    /// The rule document is not valid JSON of the expected shape. The whole
    /// document is rejected; no partial load occurs.
    #[error("failed to parse rule document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The download request failed.
    #[error("rules download failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The downloaded archive could not be unpacked.
    #[error("failed to extract rules archive: {0}")]
    Unzip(String),

    /// The cache collection could not be written.
    #[error("rules cache error: {0}")]
    Cache(#[from] pulse_store::StoreError),

    /// No rules could be produced for the URL (network failure with an
    /// empty cache, or an unusable archive).
    #[error("no rules available for {0}")]
    Unavailable(String),
}
