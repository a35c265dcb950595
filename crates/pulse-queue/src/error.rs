//! Error types for the queue layer.

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue has been closed; no further operations are accepted.
    #[error("queue is closed")]
    Closed,

    /// The queue has reached its configured capacity.
    #[error("queue is full (capacity {0})")]
    Full(usize),

    /// A pooled connection could not be obtained.
    #[error("queue storage unavailable: {0}")]
    Unavailable(#[from] r2d2::Error),

    /// A database operation failed.
    #[error("queue database error: {0}")]
    Database(#[from] rusqlite::Error),
}
