//! The event hub: dispatch, extension lifecycle, and shared state.
//!
//! The hub owns the single logical event timeline. `dispatch` assigns each
//! event a monotonically increasing sequence number and enqueues it; a
//! single dispatcher task pulls events in order, runs registered
//! pre-processors (the rules engine registers as one), fires one-shot
//! response listeners, and fans the event out to every extension with a
//! matching listener. Each extension owns a serial delivery task, so
//! delivery across extensions is parallel while delivery within one
//! extension is strictly ordered by sequence number.
//!
//! Shared state rides the same timeline: an extension publishing state tags
//! it with an event's sequence number, and any extension reading that state
//! at event `e` sees a snapshot consistent with the causal past of `e`,
//! however far behind the reader's own delivery queue is.
//!
//! # Registering an extension
//!
//! ```rust,ignore
//! hub.register_extension(|| Box::new(LifecycleExtension::default())).await?;
//! hub.start();
//! hub.dispatch(Event::new("launch", EventType::Lifecycle, EventSource::RequestContent));
//! ```

mod error;
mod extension;
mod hub;
mod listener;
mod shared_state;

pub use error::HubError;
pub use extension::{Extension, ExtensionApi};
pub use hub::{EventHub, EventPreprocessor, HubHandle, ResponseHandler};
pub use shared_state::{
    PendingResolver, Resolution, SharedStateResult, SharedStateStatus, StateNamespace,
};

#[cfg(test)]
mod tests;
