use serde::{Deserialize, Serialize};
use crate::protocol::{HOME_APP_NAME, HOME_LABEL};

/// Identity and power attributes reported by `query/device-info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Serial number, the stable identity of a device
    pub serial_number: String,

    /// Name assigned by the owner, e.g. "Living Room"
    pub user_device_name: Option<String>,

    /// Manufacturer-composed name, e.g. "Living Room Roku Ultra"
    pub friendly_device_name: Option<String>,

    pub model_name: Option<String>,

    pub power_state: PowerState,

    /// Whether the device can report suspend/display-off power modes
    pub supports_suspend: bool,
}

impl DeviceInfo {
    /// Human-readable name used to derive the device slug
    pub fn display_name(&self) -> &str {
        self.user_device_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .or(self.friendly_device_name.as_deref().filter(|name| !name.trim().is_empty()))
            .unwrap_or(&self.serial_number)
    }
}

/// Foreground app reported by `query/active-app`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveApp {
    /// Channel id; absent for the home screen
    pub id: Option<String>,

    pub name: String,

    /// Screensaver running over the home screen, if any
    pub screensaver: Option<String>,
}

impl ActiveApp {
    pub fn is_home(&self) -> bool {
        self.id.is_none() && self.name == HOME_APP_NAME
    }

    /// Label published on the app topic
    pub fn label(&self) -> String {
        if self.is_home() {
            match self.screensaver.as_deref().map(str::trim) {
                Some(saver) if !saver.is_empty() => format!("ScreenSaver: {}", saver),
                _ => HOME_LABEL.to_string(),
            }
        } else {
            self.name.clone()
        }
    }
}

/// An installed channel as listed by `query/apps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub id: String,
    pub name: String,
}

/// Power state of a device.
///
/// The first four variants are reported by the device itself; `Unreachable`
/// and `Gone` are assigned by the poller when the device stops answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    DisplayOff,
    Ready,
    Headless,
    /// No network response within the retry budget
    Unreachable,
    /// Address answers but the device API keeps failing
    Gone,
    Other(String),
}

impl PowerState {
    /// Parse the `power-mode` value of `query/device-info`
    pub fn from_wire(mode: &str) -> Self {
        match mode.trim() {
            "PowerOn" => PowerState::On,
            "DisplayOff" => PowerState::DisplayOff,
            "Ready" => PowerState::Ready,
            "Headless" => PowerState::Headless,
            "PowerOff" => PowerState::Unreachable,
            "Gone" => PowerState::Gone,
            other => PowerState::Other(other.to_string()),
        }
    }

    pub fn wire_label(&self) -> &str {
        match self {
            PowerState::On => "PowerOn",
            PowerState::DisplayOff => "DisplayOff",
            PowerState::Ready => "Ready",
            PowerState::Headless => "Headless",
            PowerState::Unreachable => "PowerOff",
            PowerState::Gone => "Gone",
            PowerState::Other(mode) => mode,
        }
    }

    /// Payload for the state topic: lower-cased with the `power` prefix removed
    pub fn payload(&self) -> String {
        let label = self.wire_label().to_lowercase();
        match label.strip_prefix("power") {
            Some(rest) => rest.to_string(),
            None => label,
        }
    }
}
