//! Privacy status tracking and hub-wide fan-out.
//!
//! The privacy monitor is an internal extension listening for
//! `configuration / requestContent` events that carry `global.privacy`.
//! Every status change is persisted to the configuration collection and
//! fanned out to the registered hit queues, so an opt-out reaches every
//! pending network queue regardless of which path dispatched the event.

use std::sync::{Arc, Mutex, RwLock};

use serde_json::json;

use pulse_hub::{Extension, ExtensionApi};
use pulse_queue::HitQueue;
use pulse_store::NamedCollection;
use pulse_types::{EventSource, EventType, PrivacyStatus, GLOBAL_PRIVACY_KEY};

/// Extension name (and shared-state owner) of the privacy monitor.
pub(crate) const PRIVACY_EXTENSION: &str = "com.pulse.privacy";

/// Collection key under which the last status is persisted.
const PRIVACY_KEY: &str = "privacy.status";

/// State shared between the runtime and the monitor extension.
pub(crate) struct PrivacyShared {
    status: RwLock<PrivacyStatus>,
    queues: Mutex<Vec<Arc<HitQueue>>>,
    collection: NamedCollection,
}

impl PrivacyShared {
    /// Loads the persisted status (defaulting to unknown) from `collection`.
    pub(crate) fn load(collection: NamedCollection) -> Self {
        let status = collection
            .get(PRIVACY_KEY)
            .and_then(|v| v.as_str().and_then(PrivacyStatus::parse))
            .unwrap_or(PrivacyStatus::Unknown);

        Self {
            status: RwLock::new(status),
            queues: Mutex::new(Vec::new()),
            collection,
        }
    }

    pub(crate) fn status(&self) -> PrivacyStatus {
        *self.status.read().expect("privacy lock poisoned")
    }

    /// Registers a hit queue for fan-out and applies the current status to
    /// it immediately.
    pub(crate) fn track_queue(&self, queue: Arc<HitQueue>) {
        queue.handle_privacy_change(self.status());
        self.queues
            .lock()
            .expect("privacy lock poisoned")
            .push(queue);
    }

    /// Applies a new status: records it, persists it, and gates every
    /// tracked hit queue.
    pub(crate) fn apply(&self, status: PrivacyStatus) {
        *self.status.write().expect("privacy lock poisoned") = status;

        if let Err(e) = self.collection.set(PRIVACY_KEY, json!(status.as_str())) {
            tracing::error!(error = %e, "failed to persist privacy status");
        }

        let queues = self.queues.lock().expect("privacy lock poisoned").clone();
        tracing::info!(%status, queues = queues.len(), "privacy status changed");
        for queue in queues {
            queue.handle_privacy_change(status);
        }
    }
}

/// The internal extension that watches the event stream for status changes.
pub(crate) struct PrivacyMonitor {
    pub(crate) shared: Arc<PrivacyShared>,
}

impl Extension for PrivacyMonitor {
    fn name(&self) -> &str {
        PRIVACY_EXTENSION
    }

    fn version(&self) -> &str {
        pulse_types::SDK_VERSION
    }

    fn on_registered(&mut self, api: &ExtensionApi) {
        let shared = Arc::clone(&self.shared);
        api.register_listener(
            EventType::Configuration,
            EventSource::RequestContent,
            move |event| {
                let Some(value) = event.data().get(GLOBAL_PRIVACY_KEY) else {
                    return;
                };
                match value.as_str().and_then(PrivacyStatus::parse) {
                    Some(status) => shared.apply(status),
                    None => {
                        tracing::warn!(?value, "unrecognised privacy status ignored")
                    }
                }
            },
        );
    }
}
