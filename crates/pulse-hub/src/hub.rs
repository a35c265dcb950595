//! The hub itself: timeline, dispatcher task, and lifecycle operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::sleep;
use uuid::Uuid;

use pulse_types::{Event, EventSource, EventType, EVENT_HUB_OWNER, SDK_VERSION};

use crate::error::HubError;
use crate::extension::{run_extension, ExtMsg, Extension, ExtensionApi, ExtensionControl};
use crate::listener::ListenerSet;
use crate::shared_state::{
    PendingResolver, Resolution, SharedStateResult, SharedStates, StateNamespace,
};

/// One-shot callback for a response listener. Receives the answering event,
/// or `None` on timeout.
pub type ResponseHandler = Box<dyn FnOnce(Option<Event>) + Send>;

/// Hook invoked on the dispatcher task before listener matching.
///
/// A pre-processor may rewrite the event's data and may dispatch follow-up
/// events (which receive later sequence numbers). The rules engine registers
/// as one.
pub trait EventPreprocessor: Send + Sync {
    /// Processes one event, returning the (possibly modified) event that
    /// listeners will observe.
    fn process(&self, event: Event) -> Event;
}

struct ResponseEntry {
    id: Uuid,
    trigger_id: Uuid,
    owner: Option<String>,
    handler: ResponseHandler,
    timer: tokio::task::JoinHandle<()>,
}

struct ExtensionHandle {
    delivery_tx: mpsc::UnboundedSender<ExtMsg>,
    listeners: Arc<ListenerSet>,
    shutdown: Arc<AtomicBool>,
    version: String,
    metadata: HashMap<String, String>,
}

pub(crate) struct HubInner {
    seq: AtomicU64,
    // Held across assign-and-enqueue so ingress order always equals seq order.
    dispatch_lock: Mutex<()>,
    started: watch::Sender<bool>,
    ingress_tx: mpsc::UnboundedSender<Event>,
    extensions: RwLock<HashMap<String, ExtensionHandle>>,
    preprocessors: RwLock<Vec<Arc<dyn EventPreprocessor>>>,
    response_listeners: Mutex<Vec<ResponseEntry>>,
    states: Arc<SharedStates>,
    state_changed: Arc<Notify>,
    self_ref: Weak<HubInner>,
}

impl HubInner {
    /// Assigns the next sequence number and enqueues the event. Returns the
    /// assigned seq.
    fn dispatch(&self, mut event: Event) -> Result<u64, HubError> {
        let _guard = self.dispatch_lock.lock().expect("dispatch lock poisoned");
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        event.assign_seq(seq);
        self.ingress_tx
            .send(event)
            .map_err(|_| HubError::Shutdown)?;
        Ok(seq)
    }

    /// The seq a shared-state write keys to: the event's, or the timeline
    /// tail for event-less writes.
    fn write_seq(&self, event: Option<&Event>) -> u64 {
        event.map(Event::seq).unwrap_or_else(|| self.seq.load(Ordering::SeqCst))
    }

    fn create_shared_state(
        &self,
        ns: StateNamespace,
        owner: &str,
        data: Map<String, Value>,
        event: Option<&Event>,
    ) -> Result<(), HubError> {
        let seq = self.write_seq(event);
        self.states.create(ns, owner, seq, data)?;
        self.state_changed.notify_waiters();
        Ok(())
    }

    fn create_pending_shared_state(
        &self,
        ns: StateNamespace,
        owner: &str,
        event: Option<&Event>,
    ) -> Result<PendingResolver, HubError> {
        let seq = self.write_seq(event);
        self.states.create_pending(ns, owner, seq)?;
        self.state_changed.notify_waiters();
        Ok(PendingResolver {
            states: Arc::downgrade(&self.states),
            notify: Arc::downgrade(&self.state_changed),
            ns,
            owner: owner.to_string(),
            seq,
        })
    }

    fn get_shared_state(
        &self,
        ns: StateNamespace,
        owner: &str,
        event: Option<&Event>,
        resolution: Resolution,
    ) -> SharedStateResult {
        let at = event.map(Event::seq).unwrap_or(u64::MAX);
        self.states.get(ns, owner, at, resolution)
    }

    fn add_response_listener(
        &self,
        owner: Option<String>,
        trigger_id: Uuid,
        timeout: Duration,
        handler: ResponseHandler,
    ) {
        let id = Uuid::new_v4();
        let weak = self.self_ref.clone();
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let expired = {
                let mut listeners = inner
                    .response_listeners
                    .lock()
                    .expect("response listener lock poisoned");
                listeners
                    .iter()
                    .position(|e| e.id == id)
                    .map(|idx| listeners.swap_remove(idx))
            };
            if let Some(entry) = expired {
                tracing::debug!(trigger = %entry.trigger_id, "response listener timed out");
                (entry.handler)(None);
            }
        });

        self.response_listeners
            .lock()
            .expect("response listener lock poisoned")
            .push(ResponseEntry {
                id,
                trigger_id,
                owner,
                handler,
                timer,
            });
    }

    /// Publishes the hub's own shared state: the registered extension set.
    /// A no-op until the hub is started.
    fn publish_hub_state(&self) {
        if !*self.started.borrow() {
            return;
        }

        let mut extensions = Map::new();
        for (name, handle) in self
            .extensions
            .read()
            .expect("extension lock poisoned")
            .iter()
        {
            let mut entry = Map::new();
            entry.insert("version".to_string(), json!(handle.version));
            if !handle.metadata.is_empty() {
                let meta: Map<String, Value> = handle
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect();
                entry.insert("metadata".to_string(), Value::Object(meta));
            }
            extensions.insert(name.clone(), Value::Object(entry));
        }

        let mut data = Map::new();
        data.insert("version".to_string(), json!(SDK_VERSION));
        data.insert("extensions".to_string(), Value::Object(extensions));

        let event = Event::new("Shared state change", EventType::Hub, EventSource::SharedState)
            .with_data(json!({ "stateowner": EVENT_HUB_OWNER }));

        match self.dispatch(event) {
            Ok(seq) => {
                if let Err(e) =
                    self.states
                        .create(StateNamespace::Standard, EVENT_HUB_OWNER, seq, data)
                {
                    tracing::error!(error = %e, "failed to publish hub shared state");
                }
                self.state_changed.notify_waiters();
            }
            Err(e) => tracing::error!(error = %e, "failed to dispatch hub state change"),
        }
    }
}

/// A cheap, non-owning handle onto the hub.
///
/// Extensions and collaborators (the rules engine, the public facade) hold
/// these instead of the hub itself; a handle never keeps the hub alive.
#[derive(Clone)]
pub struct HubHandle {
    inner: Weak<HubInner>,
}

impl HubHandle {
    /// Dispatches `event` onto the timeline.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the hub is gone.
    pub fn dispatch(&self, event: Event) -> Result<u64, HubError> {
        self.inner.upgrade().ok_or(HubError::Shutdown)?.dispatch(event)
    }

    /// Reads `owner`'s shared state at `event` (or the latest when `None`).
    /// Reads against a shut-down hub return `None` status.
    pub fn get_shared_state(
        &self,
        ns: StateNamespace,
        owner: &str,
        event: Option<&Event>,
        resolution: Resolution,
    ) -> SharedStateResult {
        match self.inner.upgrade() {
            Some(inner) => inner.get_shared_state(ns, owner, event, resolution),
            None => SharedStateResult {
                status: crate::shared_state::SharedStateStatus::None,
                value: None,
            },
        }
    }

    /// Registers an unowned one-shot response listener.
    pub fn register_response_listener(
        &self,
        trigger: &Event,
        timeout: Duration,
        handler: impl FnOnce(Option<Event>) + Send + 'static,
    ) {
        self.register_response_listener_owned(None, trigger.id(), timeout, Box::new(handler));
    }

    pub(crate) fn register_response_listener_owned(
        &self,
        owner: Option<String>,
        trigger_id: Uuid,
        timeout: Duration,
        handler: ResponseHandler,
    ) {
        match self.inner.upgrade() {
            Some(inner) => inner.add_response_listener(owner, trigger_id, timeout, handler),
            None => handler(None),
        }
    }

    pub(crate) fn create_shared_state(
        &self,
        ns: StateNamespace,
        owner: &str,
        data: Map<String, Value>,
        event: Option<&Event>,
    ) -> Result<(), HubError> {
        self.inner
            .upgrade()
            .ok_or(HubError::Shutdown)?
            .create_shared_state(ns, owner, data, event)
    }

    pub(crate) fn create_pending_shared_state(
        &self,
        ns: StateNamespace,
        owner: &str,
        event: Option<&Event>,
    ) -> Result<PendingResolver, HubError> {
        self.inner
            .upgrade()
            .ok_or(HubError::Shutdown)?
            .create_pending_shared_state(ns, owner, event)
    }
}

/// The event hub. One per [`Runtime`]; tests construct their own.
///
/// Dropping the hub ends the dispatcher and every extension task.
///
/// [`Runtime`]: https://docs.rs/pulse-sdk
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// Creates a hub and spawns its dispatcher task.
    ///
    /// Must be called from within a tokio runtime. Delivery is gated until
    /// [`start`](Self::start).
    pub fn new() -> Self {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (started, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak| HubInner {
            seq: AtomicU64::new(0),
            dispatch_lock: Mutex::new(()),
            started,
            ingress_tx,
            extensions: RwLock::new(HashMap::new()),
            preprocessors: RwLock::new(Vec::new()),
            response_listeners: Mutex::new(Vec::new()),
            states: Arc::new(SharedStates::default()),
            state_changed: Arc::new(Notify::new()),
            self_ref: weak.clone(),
        });

        // The dispatcher holds only a weak reference: dropping the hub drops
        // the ingress sender, which ends the loop.
        tokio::spawn(dispatcher_loop(Arc::downgrade(&inner), ingress_rx));

        Self { inner }
    }

    /// Returns a non-owning handle for collaborators.
    pub fn handle(&self) -> HubHandle {
        HubHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Begins delivery to extensions and publishes the hub's shared state.
    pub fn start(&self) {
        self.inner.started.send_replace(true);
        tracing::info!("event hub started");
        self.inner.publish_hub_state();
    }

    /// Gates delivery. Dispatched events accumulate until the next start.
    pub fn stop(&self) {
        self.inner.started.send_replace(false);
        tracing::info!("event hub stopped");
    }

    /// Dispatches `event`: assigns its sequence number and enqueues it.
    /// Returns immediately.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the dispatcher is gone.
    pub fn dispatch(&self, event: Event) -> Result<(), HubError> {
        self.inner.dispatch(event).map(|_seq| ())
    }

    /// Registers a pre-dispatch hook. Hooks run on the dispatcher task in
    /// registration order, before listener matching.
    pub fn register_preprocessor(&self, preprocessor: Arc<dyn EventPreprocessor>) {
        self.inner
            .preprocessors
            .write()
            .expect("preprocessor lock poisoned")
            .push(preprocessor);
    }

    /// Registers an unowned one-shot response listener.
    pub fn register_response_listener(
        &self,
        trigger: &Event,
        timeout: Duration,
        handler: impl FnOnce(Option<Event>) + Send + 'static,
    ) {
        self.inner
            .add_response_listener(None, trigger.id(), timeout, Box::new(handler));
    }

    /// Reads `owner`'s shared state at `event` (or the latest when `None`).
    pub fn get_shared_state(
        &self,
        ns: StateNamespace,
        owner: &str,
        event: Option<&Event>,
        resolution: Resolution,
    ) -> SharedStateResult {
        self.inner.get_shared_state(ns, owner, event, resolution)
    }

    /// Instantiates and registers an extension.
    ///
    /// The extension's `on_registered` runs on its own serial task; this
    /// future resolves once it has completed and the extension is ready.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the name is taken.
    pub async fn register_extension<F>(&self, factory: F) -> Result<(), HubError>
    where
        F: FnOnce() -> Box<dyn Extension> + Send + 'static,
    {
        let ext = factory();
        let name = ext.name().to_string();
        let version = ext.version().to_string();
        let metadata = ext.metadata();

        let listeners = Arc::new(ListenerSet::default());
        let paused = Arc::new(AtomicBool::new(false));
        let pause_changed = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        {
            let mut extensions = self.inner.extensions.write().expect("extension lock poisoned");
            if extensions.contains_key(&name) {
                return Err(HubError::AlreadyRegistered(name));
            }
            extensions.insert(
                name.clone(),
                ExtensionHandle {
                    delivery_tx,
                    listeners: Arc::clone(&listeners),
                    shutdown: Arc::clone(&shutdown),
                    version,
                    metadata,
                },
            );
        }
        self.inner.states.add_owner(&name);

        let api = ExtensionApi::new(
            name.clone(),
            self.handle(),
            Arc::clone(&listeners),
            Arc::clone(&paused),
            Arc::clone(&pause_changed),
        );
        let ctl = ExtensionControl {
            listeners,
            paused,
            pause_changed,
            shutdown,
            state_changed: Arc::clone(&self.inner.state_changed),
        };
        tokio::spawn(run_extension(ext, api, delivery_rx, ctl, ready_tx));

        let _ = ready_rx.await;
        tracing::info!(extension = %name, "extension registered");
        self.inner.publish_hub_state();
        Ok(())
    }

    /// Unregisters the named extension: flushes its queued deliveries,
    /// calls `on_unregistered`, and removes its listeners, shared state,
    /// and response listeners.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if the name is unknown.
    pub async fn unregister_extension(&self, name: &str) -> Result<(), HubError> {
        let handle = self
            .inner
            .extensions
            .write()
            .expect("extension lock poisoned")
            .remove(name)
            .ok_or_else(|| HubError::NotRegistered(name.to_string()))?;

        // Wake any delivery stalled on a readiness gate so the flush can't
        // hang behind it.
        handle.shutdown.store(true, Ordering::SeqCst);
        self.inner.state_changed.notify_waiters();

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.delivery_tx.send(ExtMsg::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }

        self.inner.states.remove_owner(name);

        let cancelled = {
            let mut listeners = self
                .inner
                .response_listeners
                .lock()
                .expect("response listener lock poisoned");
            let mut cancelled = Vec::new();
            let mut idx = 0;
            while idx < listeners.len() {
                if listeners[idx].owner.as_deref() == Some(name) {
                    cancelled.push(listeners.swap_remove(idx));
                } else {
                    idx += 1;
                }
            }
            cancelled
        };
        for entry in cancelled {
            entry.timer.abort();
        }

        tracing::info!(extension = %name, "extension unregistered");
        self.inner.publish_hub_state();
        Ok(())
    }

    /// Unregisters every extension and stops delivery.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self
            .inner
            .extensions
            .read()
            .expect("extension lock poisoned")
            .keys()
            .cloned()
            .collect();
        for name in names {
            if let Err(e) = self.unregister_extension(&name).await {
                tracing::error!(extension = %name, error = %e, "failed to unregister at shutdown");
            }
        }
        self.stop();

        let remaining: Vec<ResponseEntry> = self
            .inner
            .response_listeners
            .lock()
            .expect("response listener lock poisoned")
            .drain(..)
            .collect();
        for entry in remaining {
            entry.timer.abort();
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// The single dispatcher: pulls events in seq order, gates on the started
/// flag, runs pre-processors, fires response listeners, and fans out to
/// extensions with a matching listener.
async fn dispatcher_loop(weak: Weak<HubInner>, mut ingress_rx: mpsc::UnboundedReceiver<Event>) {
    let mut started_rx = match weak.upgrade() {
        Some(inner) => inner.started.subscribe(),
        None => return,
    };

    while let Some(mut event) = ingress_rx.recv().await {
        while !*started_rx.borrow() {
            if started_rx.changed().await.is_err() {
                return;
            }
        }
        let Some(inner) = weak.upgrade() else { return };

        let preprocessors: Vec<Arc<dyn EventPreprocessor>> = inner
            .preprocessors
            .read()
            .expect("preprocessor lock poisoned")
            .clone();
        for preprocessor in preprocessors {
            event = preprocessor.process(event);
        }

        if let Some(response_id) = event.response_id() {
            let matched = {
                let mut listeners = inner
                    .response_listeners
                    .lock()
                    .expect("response listener lock poisoned");
                let mut matched = Vec::new();
                let mut idx = 0;
                while idx < listeners.len() {
                    if listeners[idx].trigger_id == response_id {
                        matched.push(listeners.swap_remove(idx));
                    } else {
                        idx += 1;
                    }
                }
                matched
            };
            for entry in matched {
                entry.timer.abort();
                (entry.handler)(Some(event.clone()));
            }
        }

        let extensions = inner.extensions.read().expect("extension lock poisoned");
        for (name, handle) in extensions.iter() {
            if handle.listeners.matches(&event)
                && handle.delivery_tx.send(ExtMsg::Deliver(event.clone())).is_err()
            {
                tracing::warn!(extension = %name, "delivery to stopped extension dropped");
            }
        }
    }
}
