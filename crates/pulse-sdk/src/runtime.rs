//! The explicit runtime value that wires the core together.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;

use pulse_hub::{EventHub, EventPreprocessor, Extension, HubHandle};
use pulse_queue::HitQueue;
use pulse_rules::{PassthroughExtractor, RulesDownloader, RulesEngine};
use pulse_store::CollectionStore;
use pulse_types::{Event, EventSource, EventType, PrivacyStatus, GLOBAL_PRIVACY_KEY};

use crate::config::Config;
use crate::error::SdkError;
use crate::privacy::{PrivacyMonitor, PrivacyShared};

/// Collection that persists runtime bookkeeping (privacy status).
const CONFIGURATION_COLLECTION: &str = "configuration";

/// The assembled SDK core: hub, rules engine, datastore, downloader, and
/// privacy fan-out, as one explicit value.
///
/// There are no process-wide singletons; applications construct one
/// `Runtime` at startup and thread it through, and tests construct their
/// own.
pub struct Runtime {
    hub: EventHub,
    engine: Arc<RulesEngine>,
    downloader: RulesDownloader,
    store: CollectionStore,
    privacy: Arc<PrivacyShared>,
}

impl Runtime {
    /// Assembles a runtime from `config`: opens the datastore, spawns the
    /// hub, registers the rules engine as a pre-processor, and installs the
    /// privacy monitor extension.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SdkError` if the datastore cannot be opened or the monitor
    /// cannot register.
    pub async fn new(config: Config) -> Result<Self, SdkError> {
        let store = CollectionStore::open(&config.storage.data_dir)?;

        let hub = EventHub::new();
        let engine = Arc::new(RulesEngine::new("rulesengine", hub.handle()));
        hub.register_preprocessor(Arc::clone(&engine) as Arc<dyn EventPreprocessor>);

        let downloader = RulesDownloader::new(
            store.collection(pulse_rules::CACHE_COLLECTION),
            Arc::new(PassthroughExtractor),
            config.storage.data_dir.join("scratch"),
        );

        let privacy = Arc::new(PrivacyShared::load(
            store.collection(CONFIGURATION_COLLECTION),
        ));
        let monitor_shared = Arc::clone(&privacy);
        hub.register_extension(move || {
            Box::new(PrivacyMonitor {
                shared: monitor_shared,
            }) as Box<dyn Extension>
        })
        .await?;

        Ok(Self {
            hub,
            engine,
            downloader,
            store,
            privacy,
        })
    }

    /// Begins event delivery.
    pub fn start(&self) {
        self.hub.start();
    }

    /// Gates event delivery.
    pub fn stop(&self) {
        self.hub.stop();
    }

    /// The underlying hub, for listener and extension registration beyond
    /// the facade surface.
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// A non-owning hub handle.
    pub fn handle(&self) -> HubHandle {
        self.hub.handle()
    }

    /// The datastore backing this runtime.
    pub fn store(&self) -> &CollectionStore {
        &self.store
    }

    /// Registers an application extension.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the name is taken.
    pub async fn register_extension<F>(&self, factory: F) -> Result<(), SdkError>
    where
        F: FnOnce() -> Box<dyn Extension> + Send + 'static,
    {
        Ok(self.hub.register_extension(factory).await?)
    }

    /// Unregisters an extension by name.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if the name is unknown.
    pub async fn unregister_extension(&self, name: &str) -> Result<(), SdkError> {
        Ok(self.hub.unregister_extension(name).await?)
    }

    /// Dispatches an event onto the timeline.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the hub is gone.
    pub fn dispatch(&self, event: Event) -> Result<(), SdkError> {
        Ok(self.hub.dispatch(event)?)
    }

    /// Dispatches `event` and waits up to `timeout` for an event answering
    /// it. Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the hub is gone.
    pub async fn dispatch_with_response(
        &self,
        event: Event,
        timeout: Duration,
    ) -> Result<Option<Event>, SdkError> {
        let (tx, rx) = oneshot::channel();
        self.hub.register_response_listener(&event, timeout, move |response| {
            let _ = tx.send(response);
        });
        self.hub.dispatch(event)?;
        Ok(rx.await.unwrap_or(None))
    }

    /// Installs a rule document from raw bytes.
    ///
    /// # Errors
    ///
    /// `Parse` if the document is malformed; the active set is untouched.
    pub fn load_rules(&self, bytes: &[u8]) -> Result<(), SdkError> {
        Ok(self.engine.load_rules(bytes)?)
    }

    /// Downloads (with conditional-GET caching) and installs rules.
    ///
    /// # Errors
    ///
    /// `Unavailable` when neither network nor cache can produce a document.
    pub async fn load_remote_rules(&self, url: &str) -> Result<(), SdkError> {
        Ok(self.engine.load_remote_rules(&self.downloader, url).await?)
    }

    /// Installs rules from the download cache only, for offline starts.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the cache has no entry for `url`.
    pub fn load_cached_rules(&self, url: &str) -> Result<(), SdkError> {
        Ok(self.engine.load_cached_rules(&self.downloader, url)?)
    }

    /// Registers a hit queue for privacy fan-out, applying the current
    /// status to it immediately.
    pub fn register_hit_queue(&self, queue: Arc<HitQueue>) {
        self.privacy.track_queue(queue);
    }

    /// The current privacy status.
    pub fn privacy_status(&self) -> PrivacyStatus {
        self.privacy.status()
    }

    /// Requests a privacy status change by dispatching the standard
    /// `configuration / requestContent` event; the change applies when the
    /// event reaches the privacy monitor.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the hub is gone.
    pub fn set_privacy_status(&self, status: PrivacyStatus) -> Result<(), SdkError> {
        let event = Event::new(
            "Set privacy status",
            EventType::Configuration,
            EventSource::RequestContent,
        )
        .with_data(json!({ GLOBAL_PRIVACY_KEY: status.as_str() }));
        self.dispatch(event)
    }

    /// Unregisters every extension and stops the hub.
    pub async fn shutdown(&self) {
        self.hub.shutdown().await;
    }
}
