//! Device operating state and the validated transition machine.
//!
//! The legal transitions live in a [`TransitionTable`] built from literal
//! `(from, to)` data so the set can be audited at a glance. Listeners are
//! registered once at startup and run synchronously, in registration order,
//! on the thread that performed the transition.

use crate::config::UpgradeFailureTarget;
use crate::error::InvalidTransition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::{debug, info, warn};

/// The single authoritative operating state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceState {
    Starting = 0,
    Activating = 1,
    Idle = 2,
    Connecting = 3,
    Listening = 4,
    Speaking = 5,
    WifiConfiguring = 6,
    Upgrading = 7,
}

impl DeviceState {
    /// Every state, in declaration order.
    pub const ALL: [DeviceState; 8] = [
        Self::Starting,
        Self::Activating,
        Self::Idle,
        Self::Connecting,
        Self::Listening,
        Self::Speaking,
        Self::WifiConfiguring,
        Self::Upgrading,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Activating => "activating",
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::WifiConfiguring => "wifi_configuring",
            Self::Upgrading => "upgrading",
        }
    }

    fn from_u8(raw: u8) -> Self {
        Self::ALL
            .get(usize::from(raw))
            .copied()
            .unwrap_or(Self::Starting)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable `(previous, new)` pair delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransitionEvent {
    pub previous: DeviceState,
    pub current: DeviceState,
}

use DeviceState::{
    Activating, Connecting, Idle, Listening, Speaking, Starting, Upgrading, WifiConfiguring,
};

/// Default allow-list. `Upgrading` exits are added separately, see
/// [`TransitionTable::with_upgrade_failure`].
const DEFAULT_TRANSITIONS: &[(DeviceState, DeviceState)] = &[
    (Starting, Activating),
    (Starting, WifiConfiguring),
    (WifiConfiguring, Activating),
    (Activating, Idle),
    (Activating, Upgrading),
    (Activating, WifiConfiguring),
    (Idle, Connecting),
    (Idle, Listening),
    (Idle, Speaking),
    (Idle, Activating),
    (Idle, Upgrading),
    (Idle, WifiConfiguring),
    (Connecting, Idle),
    (Connecting, Listening),
    (Connecting, Speaking),
    (Listening, Speaking),
    (Listening, Idle),
    (Speaking, Listening),
    (Speaking, Idle),
];

/// Static `(from, to)` allow-list.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    allowed: HashSet<(DeviceState, DeviceState)>,
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::from_pairs(DEFAULT_TRANSITIONS).with_upgrade_failure(UpgradeFailureTarget::Idle)
    }
}

impl TransitionTable {
    /// Build a table from literal pairs.
    #[must_use]
    pub fn from_pairs(pairs: &[(DeviceState, DeviceState)]) -> Self {
        Self {
            allowed: pairs.iter().copied().collect(),
        }
    }

    /// Configure where a failed firmware upgrade may go.
    ///
    /// `ResetOnly` leaves `Upgrading` without outgoing edges: the only exit
    /// is a device reset, which is outside the state machine.
    #[must_use]
    pub fn with_upgrade_failure(mut self, target: UpgradeFailureTarget) -> Self {
        self.allowed.retain(|(from, _)| *from != Upgrading);
        match target {
            UpgradeFailureTarget::Idle => {
                self.allowed.insert((Upgrading, Idle));
            }
            UpgradeFailureTarget::Activating => {
                self.allowed.insert((Upgrading, Activating));
            }
            UpgradeFailureTarget::ResetOnly => {}
        }
        self
    }

    /// Add one edge.
    pub fn allow(&mut self, from: DeviceState, to: DeviceState) {
        self.allowed.insert((from, to));
    }

    /// Remove one edge.
    pub fn forbid(&mut self, from: DeviceState, to: DeviceState) {
        self.allowed.remove(&(from, to));
    }

    #[must_use]
    pub fn allows(&self, from: DeviceState, to: DeviceState) -> bool {
        self.allowed.contains(&(from, to))
    }

    /// Legal targets from `from`, in [`DeviceState::ALL`] order.
    #[must_use]
    pub fn targets(&self, from: DeviceState) -> Vec<DeviceState> {
        DeviceState::ALL
            .iter()
            .copied()
            .filter(|to| self.allows(from, *to))
            .collect()
    }
}

/// Listener invoked synchronously on every successful transition.
pub type StateListener = Box<dyn Fn(&StateTransitionEvent) + Send + Sync>;

/// Cheap, cloneable snapshot reader for other threads.
#[derive(Clone)]
pub struct StateReader {
    current: Arc<AtomicU8>,
}

impl StateReader {
    /// Snapshot of the current state. May race with an in-flight transition.
    #[must_use]
    pub fn get(&self) -> DeviceState {
        DeviceState::from_u8(self.current.load(Ordering::Acquire))
    }
}

/// Holds the current state and validates every change against the table.
pub struct StateMachine {
    table: TransitionTable,
    current: Arc<AtomicU8>,
    notifying: AtomicBool,
    listeners: Vec<StateListener>,
}

impl StateMachine {
    /// New machine in [`DeviceState::Starting`].
    #[must_use]
    pub fn new(table: TransitionTable) -> Self {
        Self {
            table,
            current: Arc::new(AtomicU8::new(Starting as u8)),
            notifying: AtomicBool::new(false),
            listeners: Vec::new(),
        }
    }

    /// Register a listener for the rest of the process lifetime.
    pub fn add_state_change_listener<F>(&mut self, listener: F)
    where
        F: Fn(&StateTransitionEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    #[must_use]
    pub fn current_state(&self) -> DeviceState {
        DeviceState::from_u8(self.current.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn reader(&self) -> StateReader {
        StateReader {
            current: Arc::clone(&self.current),
        }
    }

    #[must_use]
    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Move to `target` if `(current, target)` is allowed.
    ///
    /// All listeners have run by the time this returns. A listener that
    /// calls back into this method gets [`InvalidTransition::InProgress`].
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the edge is not in the table or a
    /// notification is still running. The state is unchanged in both cases.
    pub fn request_transition(&self, target: DeviceState) -> Result<(), InvalidTransition> {
        if self.notifying.swap(true, Ordering::AcqRel) {
            warn!("rejected re-entrant transition to {target}");
            return Err(InvalidTransition::InProgress { requested: target });
        }
        let _guard = NotifyGuard(&self.notifying);

        let previous = self.current_state();
        if !self.table.allows(previous, target) {
            warn!("rejected transition {previous} -> {target}");
            return Err(InvalidTransition::NotAllowed {
                from: previous,
                to: target,
            });
        }

        self.current.store(target as u8, Ordering::Release);
        info!("state: {previous} -> {target}");

        let event = StateTransitionEvent {
            previous,
            current: target,
        };
        for listener in &self.listeners {
            listener(&event);
        }
        debug!(listeners = self.listeners.len(), "state listeners notified");
        Ok(())
    }
}

/// Clears the notification flag even if a listener panics.
struct NotifyGuard<'a>(&'a AtomicBool);

impl Drop for NotifyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
