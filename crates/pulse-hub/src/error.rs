//! Error types for the event hub.

/// Errors that can occur during hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// An extension with the same name is already registered.
    #[error("extension '{0}' is already registered")]
    AlreadyRegistered(String),

    /// No extension with that name is registered.
    #[error("extension '{0}' is not registered")]
    NotRegistered(String),

    /// A shared-state entry already exists at (or after) that sequence
    /// number for the owner.
    #[error("shared state for '{owner}' already has an entry at or after seq {seq}")]
    DuplicateSeq {
        /// The state owner.
        owner: String,
        /// The rejected sequence number.
        seq: u64,
    },

    /// No shared-state registry exists for that owner.
    #[error("no shared-state owner '{0}'")]
    NoSuchOwner(String),

    /// The hub has been shut down; its queues are gone.
    #[error("event hub is shut down")]
    Shutdown,
}
