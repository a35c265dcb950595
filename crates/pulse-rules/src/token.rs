//! Token resolution against the event and shared-state universe.

use serde_json::{json, Value};

use pulse_hub::{HubHandle, Resolution, StateNamespace};
use pulse_types::{data, Event, SDK_VERSION};

/// Prefix for shared-state token paths: `~state.<owner>/<dotted.path>`.
const STATE_PREFIX: &str = "~state.";

/// Resolves token paths for one event.
///
/// The namespace is a union of event metadata (`~type`, `~source`,
/// `~timestamp`, `~id`, `~sdkver`), shared-state reads
/// (`~state.<owner>/<key.path>`, at this event's seq), and dotted lookups
/// into the event's data. Resolution is pure: no token read has side
/// effects.
pub struct TokenFinder<'a> {
    event: &'a Event,
    hub: &'a HubHandle,
}

impl<'a> TokenFinder<'a> {
    /// Binds a finder over `event` and the hub's state view.
    pub fn new(event: &'a Event, hub: &'a HubHandle) -> Self {
        Self { event, hub }
    }

    /// Resolves `path` to a value, or `None` on a miss.
    pub fn find(&self, path: &str) -> Option<Value> {
        match path {
            "~type" => Some(json!(self.event.event_type().as_str())),
            "~source" => Some(json!(self.event.source().as_str())),
            "~timestamp" => Some(json!(self.event.timestamp().to_rfc3339())),
            "~id" => Some(json!(self.event.id().to_string())),
            "~sdkver" => Some(json!(SDK_VERSION)),
            path if path.starts_with(STATE_PREFIX) => self.find_state(&path[STATE_PREFIX.len()..]),
            path => data::get_path(self.event.data(), path).cloned(),
        }
    }

    /// Resolves `<owner>/<dotted.path>` against the owner's shared state at
    /// this event's seq. Pending or absent states resolve to `None`.
    fn find_state(&self, rest: &str) -> Option<Value> {
        let (owner, key_path) = rest.split_once('/')?;
        let state = self.hub.get_shared_state(
            StateNamespace::Standard,
            owner,
            Some(self.event),
            Resolution::Any,
        );
        let value = Value::Object(state.value?);
        data::get_path(&value, key_path).cloned()
    }
}
