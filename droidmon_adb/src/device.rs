use serde::{Deserialize, Serialize};

/// The state of an attached device, derived from the roster tokens the
/// ADB server reports. Rendered (Display and JSON) with `ready` for a
/// usable device and `no-permission` for an inaccessible device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Fully booted and authorized (`device` in roster output).
    #[serde(rename = "ready")]
    Device,
    /// Visible but not responding.
    #[serde(rename = "offline")]
    Offline,
    /// Attached but the host key has not been accepted.
    #[serde(rename = "unauthorized")]
    Unauthorized,
    /// In the bootloader.
    #[serde(rename = "bootloader")]
    Bootloader,
    /// In recovery mode.
    #[serde(rename = "recovery")]
    Recovery,
    /// In sideload mode.
    #[serde(rename = "sideload")]
    Sideload,
    /// The adb daemon lacks permission to talk to the device node.
    #[serde(rename = "no-permission")]
    NoPermission,
    /// Anything else.
    #[serde(rename = "unknown")]
    Unknown,
}

impl DeviceState {
    /// Only a fully booted, authorized device is usable for capture.
    pub fn is_online(self) -> bool {
        self == DeviceState::Device
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            "bootloader" => DeviceState::Bootloader,
            "recovery" => DeviceState::Recovery,
            "sideload" => DeviceState::Sideload,
            _ if s.contains("no permissions") => DeviceState::NoPermission,
            _ => DeviceState::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Device => "ready",
            DeviceState::Offline => "offline",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Recovery => "recovery",
            DeviceState::Sideload => "sideload",
            DeviceState::NoPermission => "no-permission",
            DeviceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A connected Android device, keyed by its stable serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device serial (or `host:port` for TCP devices).
    pub serial: String,
    /// Current state.
    pub state: DeviceState,
    /// `product:` roster property.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product: String,
    /// `model:` roster property.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    /// `device:` roster property (hardware tag).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_tag: String,
    /// `transport_id:` roster property.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transport: String,
    /// Unix milliseconds of the first sighting.
    pub first_seen: u64,
    /// Unix milliseconds of the most recent sighting.
    pub last_seen: u64,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] model={}", self.serial, self.state, self.model)
    }
}

/// Parses the output of `host:devices-l` / `host:track-devices-l`.
///
/// Each line is `serial<whitespace>state [key:value ...]`. Unknown
/// properties are ignored; lines without at least a serial and state are
/// skipped.
pub fn parse_device_list(data: &str, now_ms: u64) -> Vec<Device> {
    data.trim()
        .lines()
        .filter_map(|line| parse_device_line(line.trim(), now_ms))
        .collect()
}

fn parse_device_line(line: &str, now_ms: u64) -> Option<Device> {
    let mut parts = line.split_whitespace();
    let serial = parts.next()?;
    let state = parts.next()?;

    let mut dev = Device {
        serial: serial.to_string(),
        state: DeviceState::parse(state),
        product: String::new(),
        model: String::new(),
        device_tag: String::new(),
        transport: String::new(),
        first_seen: now_ms,
        last_seen: now_ms,
    };

    for kv in parts {
        let Some((key, value)) = kv.split_once(':') else {
            continue;
        };
        match key {
            "product" => dev.product = value.to_string(),
            "model" => dev.model = value.to_string(),
            "device" => dev.device_tag = value.to_string(),
            "transport_id" => dev.transport = value.to_string(),
            _ => {}
        }
    }

    Some(dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_roster() {
        let frame = "emulator-5554\tdevice product:sdk model:sdk device:emu transport_id:1\n\
                     HVA1234551\tdevice product:flame model:Pixel_4 device:flame transport_id:2\n\
                     192.168.1.100:5555\toffline\n";
        let devices = parse_device_list(frame, 1_000);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].state, DeviceState::Device);
        assert!(devices[0].state.is_online());
        assert_eq!(devices[0].product, "sdk");
        assert_eq!(devices[0].transport, "1");

        assert_eq!(devices[1].model, "Pixel_4");
        assert_eq!(devices[1].device_tag, "flame");
        assert!(devices[1].state.is_online());

        assert_eq!(devices[2].serial, "192.168.1.100:5555");
        assert_eq!(devices[2].state, DeviceState::Offline);
        assert!(!devices[2].state.is_online());
    }

    #[test]
    fn parse_skips_blank_and_short_lines() {
        let devices = parse_device_list("\n\nonly-serial\n\n", 0);
        assert!(devices.is_empty());
    }

    #[test]
    fn parse_unknown_and_no_permission_states() {
        assert_eq!(DeviceState::parse("weird"), DeviceState::Unknown);
        assert_eq!(
            DeviceState::parse("no permissions (verify udev rules)"),
            DeviceState::NoPermission
        );
        assert!(!DeviceState::Unknown.is_online());
    }

    #[test]
    fn state_renders_canonical_tokens() {
        // The roster token "device" comes in; "ready" goes out.
        assert_eq!(DeviceState::parse("device").to_string(), "ready");
        assert_eq!(DeviceState::NoPermission.to_string(), "no-permission");
        assert_eq!(DeviceState::Offline.to_string(), "offline");
        assert_eq!(DeviceState::Unknown.to_string(), "unknown");
    }

    #[test]
    fn parse_ignores_malformed_properties() {
        let devices = parse_device_list("abc123 device bogus model:Pixel", 5);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].model, "Pixel");
        assert_eq!(devices[0].first_seen, 5);
    }
}
