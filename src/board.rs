//! Board capabilities the core drives: display, status LED, networking
//! and reboot.
//!
//! Real firmware supplies one [`Board`] per hardware target. The host
//! build uses [`HostBoard`], which logs what a screen would show.

use crate::state::DeviceState;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Outcome of bringing the network up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Connected,
    /// No usable credentials; the device must be provisioned first.
    NeedsProvisioning,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Screen or equivalent. Calls come from the core thread.
pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);

    fn set_emotion(&self, emotion: &str);

    fn set_chat_message(&self, role: ChatRole, text: &str);

    fn show_alert(&self, status: &str, message: &str, emotion: Option<&str>);
}

/// Status light. Follows the device state.
pub trait Led: Send + Sync {
    fn on_state_changed(&self, state: DeviceState);
}

pub trait Board: Send + Sync {
    fn name(&self) -> &str;

    fn display(&self) -> &dyn Display;

    fn led(&self) -> &dyn Led;

    /// Bring up networking. Blocks; the core calls it from a network thread.
    fn start_network(&self) -> NetworkStatus;

    fn network_status(&self) -> NetworkStatus;

    fn reboot(&self);
}

/// Display that shows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDisplay;

impl Display for NullDisplay {
    fn set_status(&self, _status: &str) {}
    fn set_emotion(&self, _emotion: &str) {}
    fn set_chat_message(&self, _role: ChatRole, _text: &str) {}
    fn show_alert(&self, _status: &str, _message: &str, _emotion: Option<&str>) {}
}

/// LED that stays dark.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLed;

impl Led for NullLed {
    fn on_state_changed(&self, _state: DeviceState) {}
}

/// Display that writes to the log.
#[derive(Debug, Default)]
pub struct LogDisplay {
    status: Mutex<String>,
}

impl Display for LogDisplay {
    fn set_status(&self, status: &str) {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *current != status {
            info!(target: "display", "[{status}]");
            status.clone_into(&mut *current);
        }
    }

    fn set_emotion(&self, emotion: &str) {
        debug!(target: "display", "emotion: {emotion}");
    }

    fn set_chat_message(&self, role: ChatRole, text: &str) {
        info!(target: "display", "{}: {text}", role.as_str());
    }

    fn show_alert(&self, status: &str, message: &str, _emotion: Option<&str>) {
        warn!(target: "display", "{status}: {message}");
    }
}

/// LED that logs state colours.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLed;

impl Led for LogLed {
    fn on_state_changed(&self, state: DeviceState) {
        let colour = match state {
            DeviceState::Listening => "red",
            DeviceState::Speaking => "green",
            DeviceState::Connecting | DeviceState::Activating => "blue (blinking)",
            DeviceState::WifiConfiguring | DeviceState::Upgrading => "yellow (blinking)",
            DeviceState::Starting | DeviceState::Idle => "off",
        };
        debug!(target: "led", "{colour}");
    }
}

/// Desktop stand-in: networking is assumed up, reboot is only recorded.
#[derive(Debug, Default)]
pub struct HostBoard {
    name: String,
    display: LogDisplay,
    led: LogLed,
    reboot_requested: AtomicBool,
}

impl HostBoard {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reboot_requested(&self) -> bool {
        self.reboot_requested.load(Ordering::Acquire)
    }
}

impl Board for HostBoard {
    fn name(&self) -> &str {
        &self.name
    }

    fn display(&self) -> &dyn Display {
        &self.display
    }

    fn led(&self) -> &dyn Led {
        &self.led
    }

    fn start_network(&self) -> NetworkStatus {
        NetworkStatus::Connected
    }

    fn network_status(&self) -> NetworkStatus {
        NetworkStatus::Connected
    }

    fn reboot(&self) {
        warn!("reboot requested; host board only records it");
        self.reboot_requested.store(true, Ordering::Release);
    }
}
