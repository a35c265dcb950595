//! Durable queueing for outbound work.
//!
//! Two layers:
//!
//! - [`DataQueue`]: an ordered, durable queue of opaque byte records over
//!   SQLite, with peek/remove/clear. Survives process restarts.
//! - [`HitQueue`]: wraps a [`DataQueue`] with a [`HitProcessor`] callback,
//!   a single worker task, retry on recoverable failures, batching, and
//!   privacy gating.
//!
//! Hits are removed only after the processor reports success (or a fatal
//! outcome), so processing is at-least-once across restarts. Duplicate
//! delivery after a mid-processing crash is the processor's responsibility
//! to tolerate.

mod data_queue;
mod error;
mod hit_queue;

pub use data_queue::{DataEntity, DataQueue};
pub use error::QueueError;
pub use hit_queue::{HitOutcome, HitProcessor, HitQueue};

#[cfg(test)]
mod tests;
