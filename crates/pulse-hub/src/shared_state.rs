//! Per-extension, event-ordered shared-state registries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, Weak};

use serde_json::{Map, Value};

use crate::error::HubError;

/// Which of the two parallel registries a read or write addresses.
///
/// Both have identical semantics; `Xdm` is a second namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateNamespace {
    /// The default registry.
    Standard,
    /// The XDM registry.
    Xdm,
}

/// Status of a shared-state read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedStateStatus {
    /// A resolved snapshot was found.
    Set,
    /// The governing entry is a placeholder awaiting resolution.
    Pending,
    /// No entry exists at or before the read point.
    None,
}

/// Result of a shared-state read: a status and, when `Set`, the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedStateResult {
    /// The read status.
    pub status: SharedStateStatus,
    /// The snapshot, present only when `status` is `Set`.
    pub value: Option<Map<String, Value>>,
}

impl SharedStateResult {
    fn none() -> Self {
        Self {
            status: SharedStateStatus::None,
            value: None,
        }
    }

    fn pending() -> Self {
        Self {
            status: SharedStateStatus::Pending,
            value: None,
        }
    }

    fn set(value: Map<String, Value>) -> Self {
        Self {
            status: SharedStateStatus::Set,
            value: Some(value),
        }
    }
}

/// Read policy for [`SharedStates::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    /// Return whatever entry governs the read point.
    #[default]
    Any,
    /// Return `Pending` if any entry at or before the read point is still
    /// pending, even when the governing entry is set.
    Barrier,
}

/// One entry in an owner's history.
#[derive(Debug, Clone)]
enum StateEntry {
    Set(Map<String, Value>),
    Pending,
}

/// Both shared-state registries, keyed by owner name.
///
/// Histories are append-only: sequence numbers within one owner strictly
/// increase, and the only in-place mutation is `Pending` → `Set` via a
/// [`PendingResolver`]. Reads never block writers for other owners.
#[derive(Default)]
pub(crate) struct SharedStates {
    standard: RwLock<HashMap<String, OwnerHistory>>,
    xdm: RwLock<HashMap<String, OwnerHistory>>,
}

type OwnerHistory = BTreeMap<u64, StateEntry>;

impl SharedStates {
    fn registry(&self, ns: StateNamespace) -> &RwLock<HashMap<String, OwnerHistory>> {
        match ns {
            StateNamespace::Standard => &self.standard,
            StateNamespace::Xdm => &self.xdm,
        }
    }

    /// Creates empty histories for `owner` in both namespaces.
    pub(crate) fn add_owner(&self, owner: &str) {
        for ns in [StateNamespace::Standard, StateNamespace::Xdm] {
            self.registry(ns)
                .write()
                .expect("shared-state lock poisoned")
                .entry(owner.to_string())
                .or_default();
        }
    }

    /// Drops `owner` from both namespaces. Subsequent reads return `None`.
    pub(crate) fn remove_owner(&self, owner: &str) {
        for ns in [StateNamespace::Standard, StateNamespace::Xdm] {
            self.registry(ns)
                .write()
                .expect("shared-state lock poisoned")
                .remove(owner);
        }
    }

    /// Inserts a resolved snapshot for `owner` at `seq`.
    ///
    /// # Errors
    ///
    /// `NoSuchOwner` if the owner is unknown; `DuplicateSeq` if an entry
    /// already exists at or after `seq` (histories are append-only).
    pub(crate) fn create(
        &self,
        ns: StateNamespace,
        owner: &str,
        seq: u64,
        value: Map<String, Value>,
    ) -> Result<(), HubError> {
        self.insert(ns, owner, seq, StateEntry::Set(value))
    }

    /// Inserts a pending placeholder for `owner` at `seq`.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub(crate) fn create_pending(
        &self,
        ns: StateNamespace,
        owner: &str,
        seq: u64,
    ) -> Result<(), HubError> {
        self.insert(ns, owner, seq, StateEntry::Pending)
    }

    fn insert(
        &self,
        ns: StateNamespace,
        owner: &str,
        seq: u64,
        entry: StateEntry,
    ) -> Result<(), HubError> {
        let mut registry = self.registry(ns).write().expect("shared-state lock poisoned");
        let history = registry
            .get_mut(owner)
            .ok_or_else(|| HubError::NoSuchOwner(owner.to_string()))?;

        if let Some((&tail, _)) = history.last_key_value() {
            if tail >= seq {
                return Err(HubError::DuplicateSeq {
                    owner: owner.to_string(),
                    seq,
                });
            }
        }

        history.insert(seq, entry);
        Ok(())
    }

    /// Resolves the pending entry for `owner` at exactly `seq`.
    ///
    /// The `Pending` → `Set` transition is the only in-place mutation a
    /// history permits; a second resolution (or resolving a set entry) is
    /// rejected.
    pub(crate) fn resolve(
        &self,
        ns: StateNamespace,
        owner: &str,
        seq: u64,
        value: Map<String, Value>,
    ) -> Result<(), HubError> {
        let mut registry = self.registry(ns).write().expect("shared-state lock poisoned");
        let history = registry
            .get_mut(owner)
            .ok_or_else(|| HubError::NoSuchOwner(owner.to_string()))?;

        match history.get_mut(&seq) {
            Some(entry @ StateEntry::Pending) => {
                *entry = StateEntry::Set(value);
                Ok(())
            }
            Some(StateEntry::Set(_)) | None => Err(HubError::DuplicateSeq {
                owner: owner.to_string(),
                seq,
            }),
        }
    }

    /// Reads the entry for `owner` with the greatest seq ≤ `at`.
    ///
    /// Unknown owners (never registered, or unregistered) read as `None`.
    pub(crate) fn get(
        &self,
        ns: StateNamespace,
        owner: &str,
        at: u64,
        resolution: Resolution,
    ) -> SharedStateResult {
        let registry = self.registry(ns).read().expect("shared-state lock poisoned");
        let Some(history) = registry.get(owner) else {
            return SharedStateResult::none();
        };

        let Some((_, governing)) = history.range(..=at).next_back() else {
            return SharedStateResult::none();
        };

        if resolution == Resolution::Barrier {
            let any_pending = history
                .range(..=at)
                .any(|(_, e)| matches!(e, StateEntry::Pending));
            if any_pending {
                return SharedStateResult::pending();
            }
        }

        match governing {
            StateEntry::Set(value) => SharedStateResult::set(value.clone()),
            StateEntry::Pending => SharedStateResult::pending(),
        }
    }

    /// The greatest seq recorded for `owner`, if any.
    pub(crate) fn tail(&self, ns: StateNamespace, owner: &str) -> Option<u64> {
        let registry = self.registry(ns).read().expect("shared-state lock poisoned");
        registry
            .get(owner)
            .and_then(|h| h.last_key_value().map(|(&seq, _)| seq))
    }
}

/// One-shot handle that converts a pending entry to a set entry.
///
/// Returned by `create_pending_shared_state`; call
/// [`resolve`](Self::resolve) exactly once. Dropping the resolver leaves
/// the entry pending forever, which consumers observe as `Pending`.
pub struct PendingResolver {
    pub(crate) states: Weak<SharedStates>,
    pub(crate) notify: Weak<tokio::sync::Notify>,
    pub(crate) ns: StateNamespace,
    pub(crate) owner: String,
    pub(crate) seq: u64,
}

impl PendingResolver {
    /// Resolves the placeholder with `value`.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the hub is gone, `NoSuchOwner` if the owner was
    /// unregistered, `DuplicateSeq` if the entry was already resolved.
    pub fn resolve(self, value: Map<String, Value>) -> Result<(), HubError> {
        let states = self.states.upgrade().ok_or(HubError::Shutdown)?;
        states.resolve(self.ns, &self.owner, self.seq, value)?;
        if let Some(notify) = self.notify.upgrade() {
            notify.notify_waiters();
        }
        Ok(())
    }
}
