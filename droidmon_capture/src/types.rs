use serde::{Deserialize, Serialize};

/// How network data is captured from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Probe the device and pick the best available mode.
    Auto,
    /// Stream tcpdump text output (requires tcpdump on the device).
    Tcpdump,
    /// Poll the kernel socket tables under /proc/net (no root needed).
    ProcNet,
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CaptureMode::Auto => "auto",
            CaptureMode::Tcpdump => "tcpdump",
            CaptureMode::ProcNet => "procnet",
        })
    }
}

impl std::str::FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(CaptureMode::Auto),
            "tcpdump" => Ok(CaptureMode::Tcpdump),
            "procnet" => Ok(CaptureMode::ProcNet),
            other => Err(format!("unknown capture mode {other:?}")),
        }
    }
}

/// Network protocol of a packet or connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "ICMP")]
    Icmp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
        })
    }
}

/// Kernel socket state, as encoded in the `st` column of /proc/net
/// tables. Unrecognized values are preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown(u8),
}

impl ConnState {
    /// Maps the hex `st` column (01–0B) to a state.
    pub fn from_hex(v: u8) -> Self {
        match v {
            0x01 => ConnState::Established,
            0x02 => ConnState::SynSent,
            0x03 => ConnState::SynRecv,
            0x04 => ConnState::FinWait1,
            0x05 => ConnState::FinWait2,
            0x06 => ConnState::TimeWait,
            0x07 => ConnState::Close,
            0x08 => ConnState::CloseWait,
            0x09 => ConnState::LastAck,
            0x0A => ConnState::Listen,
            0x0B => ConnState::Closing,
            other => ConnState::Unknown(other),
        }
    }

    fn as_str(&self) -> std::borrow::Cow<'static, str> {
        use std::borrow::Cow;
        match self {
            ConnState::Established => Cow::Borrowed("ESTABLISHED"),
            ConnState::SynSent => Cow::Borrowed("SYN_SENT"),
            ConnState::SynRecv => Cow::Borrowed("SYN_RECV"),
            ConnState::FinWait1 => Cow::Borrowed("FIN_WAIT1"),
            ConnState::FinWait2 => Cow::Borrowed("FIN_WAIT2"),
            ConnState::TimeWait => Cow::Borrowed("TIME_WAIT"),
            ConnState::Close => Cow::Borrowed("CLOSE"),
            ConnState::CloseWait => Cow::Borrowed("CLOSE_WAIT"),
            ConnState::LastAck => Cow::Borrowed("LAST_ACK"),
            ConnState::Listen => Cow::Borrowed("LISTEN"),
            ConnState::Closing => Cow::Borrowed("CLOSING"),
            ConnState::Unknown(v) => Cow::Owned(format!("UNKNOWN_{v:02X}")),
        }
    }
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState::Unknown(0)
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl Serialize for ConnState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConnState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "ESTABLISHED" => ConnState::Established,
            "SYN_SENT" => ConnState::SynSent,
            "SYN_RECV" => ConnState::SynRecv,
            "FIN_WAIT1" => ConnState::FinWait1,
            "FIN_WAIT2" => ConnState::FinWait2,
            "TIME_WAIT" => ConnState::TimeWait,
            "CLOSE" => ConnState::Close,
            "CLOSE_WAIT" => ConnState::CloseWait,
            "LAST_ACK" => ConnState::LastAck,
            "LISTEN" => ConnState::Listen,
            "CLOSING" => ConnState::Closing,
            other => {
                let v = other
                    .strip_prefix("UNKNOWN_")
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .unwrap_or(0);
                ConnState::Unknown(v)
            }
        })
    }
}

/// A single captured network packet (from tcpdump, a socket-table diff,
/// or a logcat HTTP observation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkPacket {
    pub id: String,
    pub serial: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_ip: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub src_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst_ip: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub dst_port: u16,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub length: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flags: String,

    // HTTP fields, populated when an HTTP layer was observed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_host: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub http_status: u16,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw: String,
}

/// An active TCP/UDP socket observed in the device's kernel tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub serial: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub state: ConnState,
    pub protocol: Protocol,
    pub uid: u32,
    /// Resolved remote hostname; empty until resolution succeeds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Owning application package; empty until the UID map is loaded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_name: String,
    /// Unix milliseconds.
    pub first_seen: u64,
    /// Unix milliseconds.
    pub last_seen: u64,
}

impl Connection {
    /// The engine's identity tuple: a connection is "the same" only if
    /// the addresses and the socket state all match.
    pub fn identity_key(&self) -> String {
        format!(
            "{}:{}->{}:{}/{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port, self.state
        )
    }

    /// The store's de-dup key: addresses only, so a state transition
    /// updates the stored entry in place.
    pub fn addr_key(&self) -> String {
        format!(
            "{}:{}->{}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// Statistics for one device's capture session. All counters come from
/// atomics, so a snapshot is cheap and lock-free.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureStats {
    pub serial: String,
    pub mode: String,
    pub packet_count: u64,
    pub conn_count: u64,
    pub bytes_read: u64,
    pub started_at: u64,
    pub last_activity: u64,
    pub errors: u64,
}

/// Ports that typically carry HTTP(S) traffic.
pub fn is_http_port(port: u16) -> bool {
    matches!(
        port,
        80 | 443 | 8080 | 8443 | 3000 | 5000 | 8000 | 8888 | 9090
    )
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_state_hex_mapping() {
        assert_eq!(ConnState::from_hex(0x01), ConnState::Established);
        assert_eq!(ConnState::from_hex(0x02), ConnState::SynSent);
        assert_eq!(ConnState::from_hex(0x06), ConnState::TimeWait);
        assert_eq!(ConnState::from_hex(0x0A), ConnState::Listen);
        assert_eq!(ConnState::from_hex(0x0B), ConnState::Closing);
        assert_eq!(ConnState::from_hex(0x1F), ConnState::Unknown(0x1F));
    }

    #[test]
    fn conn_state_display() {
        assert_eq!(ConnState::Established.to_string(), "ESTABLISHED");
        assert_eq!(ConnState::Unknown(0x1F).to_string(), "UNKNOWN_1F");
    }

    #[test]
    fn http_port_heuristic() {
        assert!(is_http_port(80));
        assert!(is_http_port(443));
        assert!(!is_http_port(22));
    }

    #[test]
    fn identity_key_includes_state() {
        let mut c = Connection {
            local_ip: "10.0.0.2".into(),
            local_port: 1234,
            remote_ip: "1.2.3.4".into(),
            remote_port: 443,
            state: ConnState::Established,
            ..Connection::default()
        };
        let established = c.identity_key();
        c.state = ConnState::TimeWait;
        assert_ne!(established, c.identity_key());
        assert_eq!(c.addr_key(), "10.0.0.2:1234->1.2.3.4:443");
    }
}
