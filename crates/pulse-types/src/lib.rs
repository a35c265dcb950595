//! Shared types, vocabularies, and constants for the Pulse SDK core.
//!
//! This crate provides the foundational types used across all Pulse crates:
//! the [`Event`] envelope and its type/source vocabularies, the
//! [`PrivacyStatus`] wire values, and the event-data merge and path-lookup
//! helpers in [`data`].
//!
//! No crate in the workspace depends on anything *except* `pulse-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};

mod event;
pub mod data;

pub use event::{Event, EventSource, EventType};

/// Shared-state owner name under which the hub publishes its own state.
pub const EVENT_HUB_OWNER: &str = "com.pulse.eventhub";

/// Event data key that carries a privacy status change on
/// `configuration / requestContent` events.
pub const GLOBAL_PRIVACY_KEY: &str = "global.privacy";

/// SDK version string exposed to rule tokens as `~sdkver`.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy status gating network-bound work.
///
/// Carried on `configuration / requestContent` events under
/// [`GLOBAL_PRIVACY_KEY`] and fanned out to every hit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyStatus {
    /// The user has opted in; queued work may be sent.
    #[serde(rename = "optedin")]
    OptedIn,
    /// The user has opted out; queued work is dropped.
    #[serde(rename = "optedout")]
    OptedOut,
    /// Consent is not yet known; work accumulates but is not sent.
    #[serde(rename = "optunknown")]
    Unknown,
}

impl PrivacyStatus {
    /// Returns the canonical wire string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OptedIn => "optedin",
            Self::OptedOut => "optedout",
            Self::Unknown => "optunknown",
        }
    }

    /// Parses a wire string, case-insensitively.
    ///
    /// Returns `None` for unrecognised values.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "optedin" => Some(Self::OptedIn),
            "optedout" => Some(Self::OptedOut),
            "optunknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for PrivacyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privacy_status_round_trip() {
        for status in [
            PrivacyStatus::OptedIn,
            PrivacyStatus::OptedOut,
            PrivacyStatus::Unknown,
        ] {
            assert_eq!(PrivacyStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn privacy_status_parse_is_case_insensitive() {
        assert_eq!(PrivacyStatus::parse("OPTEDIN"), Some(PrivacyStatus::OptedIn));
        assert_eq!(PrivacyStatus::parse("OptedOut"), Some(PrivacyStatus::OptedOut));
        assert_eq!(PrivacyStatus::parse("optUnknown"), Some(PrivacyStatus::Unknown));
    }

    #[test]
    fn privacy_status_parse_rejects_unknown() {
        assert_eq!(PrivacyStatus::parse(""), None);
        assert_eq!(PrivacyStatus::parse("yes"), None);
    }

    #[test]
    fn privacy_status_serde_uses_wire_strings() {
        let json = serde_json::to_string(&PrivacyStatus::OptedOut).unwrap();
        assert_eq!(json, "\"optedout\"");
        let back: PrivacyStatus = serde_json::from_str("\"optunknown\"").unwrap();
        assert_eq!(back, PrivacyStatus::Unknown);
    }
}
