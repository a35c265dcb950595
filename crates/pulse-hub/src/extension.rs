//! The extension contract, its runtime facade, and the serial delivery task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::sleep;

use pulse_types::{Event, EventSource, EventType};

use crate::error::HubError;
use crate::hub::HubHandle;
use crate::listener::ListenerSet;
use crate::shared_state::{PendingResolver, Resolution, SharedStateResult, StateNamespace};

/// How often a stalled `ready_for_event` gate re-polls when no shared-state
/// change arrives to wake it.
const READY_REPOLL: Duration = Duration::from_millis(100);

/// An independently registered subsystem that subscribes to events and
/// optionally publishes shared state.
///
/// Implementations install their listeners (and typically their initial
/// shared state) in [`on_registered`](Self::on_registered). All callbacks
/// run on the extension's own serial task; blocking inside one blocks only
/// this extension's deliveries.
pub trait Extension: Send + 'static {
    /// Unique name within the hub; also the extension's shared-state owner.
    fn name(&self) -> &str;

    /// Version string published in the hub's shared state.
    fn version(&self) -> &str;

    /// Additional metadata published in the hub's shared state.
    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Called once, on the extension's serial task, before any delivery.
    fn on_registered(&mut self, _api: &ExtensionApi) {}

    /// Called once when the extension is unregistered, after in-flight
    /// deliveries have flushed.
    fn on_unregistered(&mut self) {}

    /// Polled before each delivery. Returning false holds the event (and
    /// everything behind it) in this extension's queue; the gate re-polls
    /// after the next shared-state update anywhere.
    fn ready_for_event(&self, _event: &Event) -> bool {
        true
    }
}

/// The narrow surface an extension sees of the hub.
///
/// Cloneable and cheap; handlers capture clones of it. Holds no owning
/// reference back to the hub.
#[derive(Clone)]
pub struct ExtensionApi {
    name: String,
    hub: HubHandle,
    listeners: Arc<ListenerSet>,
    paused: Arc<AtomicBool>,
    pause_changed: Arc<Notify>,
}

impl ExtensionApi {
    pub(crate) fn new(
        name: String,
        hub: HubHandle,
        listeners: Arc<ListenerSet>,
        paused: Arc<AtomicBool>,
        pause_changed: Arc<Notify>,
    ) -> Self {
        Self {
            name,
            hub,
            listeners,
            paused,
            pause_changed,
        }
    }

    /// The owning extension's name.
    pub fn extension_name(&self) -> &str {
        &self.name
    }

    /// Dispatches `event` onto the hub's timeline.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the hub is gone.
    pub fn dispatch(&self, event: Event) -> Result<(), HubError> {
        self.hub.dispatch(event).map(|_seq| ())
    }

    /// Subscribes to events matching `(event_type, source)`; wildcards are
    /// allowed on either axis. The handler runs on this extension's serial
    /// task, in sequence order.
    pub fn register_listener(
        &self,
        event_type: EventType,
        source: EventSource,
        handler: impl FnMut(&Event) + Send + 'static,
    ) {
        self.listeners.add(event_type, source, Box::new(handler));
    }

    /// Registers a one-shot listener for the first event answering
    /// `trigger`. The handler receives `None` if `timeout` expires first.
    pub fn register_response_listener(
        &self,
        trigger: &Event,
        timeout: Duration,
        handler: impl FnOnce(Option<Event>) + Send + 'static,
    ) {
        self.hub.register_response_listener_owned(
            Some(self.name.clone()),
            trigger.id(),
            timeout,
            Box::new(handler),
        );
    }

    /// Publishes a shared-state snapshot for this extension, keyed to
    /// `event`'s sequence number (or the timeline tail when `None`).
    ///
    /// # Errors
    ///
    /// `DuplicateSeq` if an entry already exists at or after that point.
    pub fn create_shared_state(
        &self,
        data: Map<String, Value>,
        event: Option<&Event>,
    ) -> Result<(), HubError> {
        self.hub
            .create_shared_state(StateNamespace::Standard, &self.name, data, event)
    }

    /// XDM-namespace variant of [`create_shared_state`](Self::create_shared_state).
    pub fn create_xdm_shared_state(
        &self,
        data: Map<String, Value>,
        event: Option<&Event>,
    ) -> Result<(), HubError> {
        self.hub
            .create_shared_state(StateNamespace::Xdm, &self.name, data, event)
    }

    /// Inserts a pending placeholder and returns its one-shot resolver.
    ///
    /// # Errors
    ///
    /// Same as [`create_shared_state`](Self::create_shared_state).
    pub fn create_pending_shared_state(
        &self,
        event: Option<&Event>,
    ) -> Result<PendingResolver, HubError> {
        self.hub
            .create_pending_shared_state(StateNamespace::Standard, &self.name, event)
    }

    /// XDM-namespace variant of
    /// [`create_pending_shared_state`](Self::create_pending_shared_state).
    pub fn create_pending_xdm_shared_state(
        &self,
        event: Option<&Event>,
    ) -> Result<PendingResolver, HubError> {
        self.hub
            .create_pending_shared_state(StateNamespace::Xdm, &self.name, event)
    }

    /// Reads `owner`'s shared state at `event` (or the latest when `None`).
    pub fn get_shared_state(
        &self,
        owner: &str,
        event: Option<&Event>,
        resolution: Resolution,
    ) -> SharedStateResult {
        self.hub
            .get_shared_state(StateNamespace::Standard, owner, event, resolution)
    }

    /// XDM-namespace variant of [`get_shared_state`](Self::get_shared_state).
    pub fn get_xdm_shared_state(
        &self,
        owner: &str,
        event: Option<&Event>,
        resolution: Resolution,
    ) -> SharedStateResult {
        self.hub
            .get_shared_state(StateNamespace::Xdm, owner, event, resolution)
    }

    /// Resumes delivery to this extension.
    pub fn start_events(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.pause_changed.notify_waiters();
    }

    /// Pauses delivery to this extension. Events queue up; other extensions
    /// are unaffected.
    pub fn stop_events(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
}

/// A message on an extension's serial queue.
pub(crate) enum ExtMsg {
    /// Deliver an event to matching listeners.
    Deliver(Event),
    /// Flush and shut down, acking when done.
    Shutdown(oneshot::Sender<()>),
}

/// Shared handles between the hub, the facade, and the serial task.
pub(crate) struct ExtensionControl {
    pub(crate) listeners: Arc<ListenerSet>,
    pub(crate) paused: Arc<AtomicBool>,
    pub(crate) pause_changed: Arc<Notify>,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) state_changed: Arc<Notify>,
}

/// The serial delivery loop for one extension.
///
/// Calls `on_registered`, signals readiness, then processes queue messages
/// in FIFO order. Within this task, handler invocations never overlap and
/// events are observed in strictly ascending sequence order.
pub(crate) async fn run_extension(
    mut ext: Box<dyn Extension>,
    api: ExtensionApi,
    mut rx: mpsc::UnboundedReceiver<ExtMsg>,
    ctl: ExtensionControl,
    ready_tx: oneshot::Sender<()>,
) {
    let name = ext.name().to_string();

    let registered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        ext.on_registered(&api)
    }));
    if registered.is_err() {
        tracing::error!(extension = %name, "on_registered panicked");
    }
    let _ = ready_tx.send(());

    while let Some(msg) = rx.recv().await {
        match msg {
            ExtMsg::Deliver(event) => {
                if deliver(&mut ext, &ctl, &event).await {
                    tracing::trace!(extension = %name, event = %event.name(), seq = event.seq(), "delivered");
                }
            }
            ExtMsg::Shutdown(ack) => {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    ext.on_unregistered()
                }));
                if result.is_err() {
                    tracing::error!(extension = %name, "on_unregistered panicked");
                }
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// Gates one delivery on pause state and `ready_for_event`, then invokes the
/// matching handlers. Returns false if the delivery was abandoned because
/// the extension is shutting down.
async fn deliver(
    ext: &mut Box<dyn Extension>,
    ctl: &ExtensionControl,
    event: &Event,
) -> bool {
    // Pause gate: hold until start_events.
    while ctl.paused.load(Ordering::SeqCst) {
        if ctl.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let resumed = ctl.pause_changed.notified();
        if !ctl.paused.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = resumed => {}
            _ = sleep(READY_REPOLL) => {}
        }
    }

    // Readiness gate: re-poll after every shared-state commit anywhere.
    loop {
        if ctl.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let ready = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ext.ready_for_event(event)
        }))
        .unwrap_or(true);
        if ready {
            break;
        }
        let changed = ctl.state_changed.notified();
        tokio::select! {
            _ = changed => {}
            _ = sleep(READY_REPOLL) => {}
        }
    }

    for id in ctl.listeners.matching_ids(event) {
        ctl.listeners.invoke(id, event);
    }
    true
}
