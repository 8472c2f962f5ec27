use droidmon_adb::{Device, DeviceState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Classifies device lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A serial appeared in the roster for the first time.
    DeviceConnected,
    /// A known serial vanished from a roster snapshot.
    DeviceDisconnected,
    /// A known serial changed state (e.g. `unauthorized` → `device`).
    DeviceStateChanged,
    /// A periodic property collection completed for a device.
    DeviceProperties,
}

/// A device lifecycle or property event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The device serial this event concerns.
    pub serial: String,
    /// Full device record, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    /// Previous state, for state changes and disconnects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<DeviceState>,
    /// New state, for connects and state changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<DeviceState>,
    /// Collected properties, for property events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<HashMap<String, String>>,
    /// Unix milliseconds when the event was observed.
    pub timestamp: u64,
}

impl Event {
    /// A minimal event of `kind` for `serial` at `timestamp`.
    pub fn new(kind: EventKind, serial: &str, timestamp: u64) -> Self {
        Self {
            kind,
            serial: serial.to_string(),
            device: None,
            old_state: None,
            new_state: None,
            props: None,
            timestamp,
        }
    }
}
