//! Listener bookkeeping for one extension.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use pulse_types::{Event, EventSource, EventType};

/// An event-handling closure owned by one extension. Invoked on the
/// extension's serial task, never concurrently with itself or any other
/// handler of the same extension.
pub(crate) type ListenerHandler = Box<dyn FnMut(&Event) + Send>;

/// The listeners registered by one extension.
///
/// Selectors are kept separate from handlers so the dispatcher can match
/// without contending with a handler invocation in progress: matching takes
/// the selector read lock, invocation takes the handler mutex.
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    selectors: RwLock<Vec<Selector>>,
    handlers: Mutex<HashMap<u64, ListenerHandler>>,
}

struct Selector {
    id: u64,
    event_type: EventType,
    source: EventSource,
}

impl ListenerSet {
    /// Adds a listener; wildcards are allowed on either axis.
    pub(crate) fn add(
        &self,
        event_type: EventType,
        source: EventSource,
        handler: ListenerHandler,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.selectors
            .write()
            .expect("listener lock poisoned")
            .push(Selector {
                id,
                event_type,
                source,
            });
        self.handlers
            .lock()
            .expect("listener lock poisoned")
            .insert(id, handler);
    }

    /// Whether any selector accepts `event`.
    pub(crate) fn matches(&self, event: &Event) -> bool {
        self.selectors
            .read()
            .expect("listener lock poisoned")
            .iter()
            .any(|s| s.event_type.matches(event.event_type()) && s.source.matches(event.source()))
    }

    /// Ids of matching listeners, in registration order.
    pub(crate) fn matching_ids(&self, event: &Event) -> Vec<u64> {
        self.selectors
            .read()
            .expect("listener lock poisoned")
            .iter()
            .filter(|s| {
                s.event_type.matches(event.event_type()) && s.source.matches(event.source())
            })
            .map(|s| s.id)
            .collect()
    }

    /// Runs the handler registered under `id`, isolating panics.
    pub(crate) fn invoke(&self, id: u64, event: &Event) {
        let mut handlers = self.handlers.lock().expect("listener lock poisoned");
        let Some(handler) = handlers.get_mut(&id) else {
            return;
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
        if result.is_err() {
            tracing::error!(
                event = %event.name(),
                listener = id,
                "listener panicked; delivery marked complete"
            );
        }
    }
}
