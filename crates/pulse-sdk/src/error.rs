//! Error types for the SDK facade.

/// Errors surfaced by the [`Runtime`](crate::Runtime).
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// The datastore could not be opened or written.
    #[error(transparent)]
    Store(#[from] pulse_store::StoreError),

    /// A hub operation failed.
    #[error(transparent)]
    Hub(#[from] pulse_hub::HubError),

    /// A rules pipeline operation failed.
    #[error(transparent)]
    Rules(#[from] pulse_rules::RulesError),

    /// A hit queue operation failed.
    #[error(transparent)]
    Queue(#[from] pulse_queue::QueueError),
}
