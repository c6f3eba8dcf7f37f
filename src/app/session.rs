//! The conversational session the core is currently running.

use crate::config::ListeningMode;
use crate::protocol::ControlMessage;
use crate::state::DeviceState;

/// Work deferred until the device reaches a given state.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    PlaySound(String),
    SendControl(ControlMessage),
}

/// One exchange with the server, from `Connecting` until back in `Idle`.
#[derive(Debug)]
pub struct Session {
    id: u64,
    mode: ListeningMode,
    /// Keyword that opened the session, reported once with `listen detect`.
    wake_word: Option<String>,
    connect_attempts: u32,
    connected: bool,
    pending: Vec<(DeviceState, PendingAction)>,
}

impl Session {
    #[must_use]
    pub fn new(id: u64, mode: ListeningMode, wake_word: Option<String>) -> Self {
        Self {
            id,
            mode,
            wake_word,
            connect_attempts: 0,
            connected: false,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn mode(&self) -> ListeningMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ListeningMode) {
        self.mode = mode;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn mark_connected(&mut self) {
        self.connected = true;
    }

    pub fn set_wake_word(&mut self, keyword: Option<String>) {
        self.wake_word = keyword;
    }

    pub fn take_wake_word(&mut self) -> Option<String> {
        self.wake_word.take()
    }

    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Count one more connect attempt and return the total so far.
    pub fn record_attempt(&mut self) -> u32 {
        self.connect_attempts += 1;
        self.connect_attempts
    }

    /// Run `action` the next time the device enters `state`.
    pub fn defer(&mut self, state: DeviceState, action: PendingAction) {
        self.pending.push((state, action));
    }

    /// Remove and return every action waiting for `state`, in the order
    /// they were deferred.
    pub fn take_pending(&mut self, state: DeviceState) -> Vec<PendingAction> {
        let (due, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|(when, _)| *when == state);
        self.pending = rest;
        due.into_iter().map(|(_, action)| action).collect()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
