use crate::types::{ConnState, Connection, Protocol};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// /proc/net/tcp format:
//   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
//    0: 0100007F:13AD 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345

/// Parses /proc/net/{tcp,tcp6,udp,udp6} snapshots into [`Connection`]s.
pub struct ProcNetParser {
    serial: String,
    next_id: u64,
}

impl ProcNetParser {
    /// Creates a parser attributing connections to `serial`.
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            next_id: 0,
        }
    }

    /// Parses one full table snapshot. Header lines, malformed rows,
    /// loopback-to-loopback sockets, and wildcard listeners are skipped.
    pub fn parse_table(&mut self, output: &str, proto: Protocol, now_ms: u64) -> Vec<Connection> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("sl"))
            .filter_map(|line| self.parse_line(line, proto, now_ms))
            .collect()
    }

    fn parse_line(&mut self, line: &str, proto: Protocol, now_ms: u64) -> Option<Connection> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }

        let (local_ip, local_port) = parse_hex_addr(fields[1])?;
        let (remote_ip, remote_port) = parse_hex_addr(fields[2])?;
        let state = ConnState::from_hex(u8::from_str_radix(fields[3], 16).ok()?);
        let uid: u32 = fields[7].parse().unwrap_or(0);

        // Loopback chatter and wildcard listeners are noise for
        // connection tracking.
        if is_loopback(&local_ip) && is_loopback(&remote_ip) {
            return None;
        }
        if is_unspecified(&remote_ip) && state == ConnState::Listen {
            return None;
        }

        self.next_id += 1;
        Some(Connection {
            id: format!("{}-conn-{}", self.serial, self.next_id),
            serial: self.serial.clone(),
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            state,
            protocol: proto,
            uid,
            hostname: String::new(),
            app_name: String::new(),
            first_seen: now_ms,
            last_seen: now_ms,
        })
    }
}

/// Parses `HEXIP:HEXPORT`. The port is big-endian hex.
pub(crate) fn parse_hex_addr(addr: &str) -> Option<(String, u16)> {
    let (ip_hex, port_hex) = addr.split_once(':')?;
    let ip = parse_hex_ip(ip_hex)?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    Some((ip, port))
}

/// Converts a /proc/net hex address to its textual form.
///
/// IPv4 is a little-endian 32-bit value; IPv6 is four 32-bit words, each
/// little-endian. An IPv6-mapped IPv4 address renders as plain IPv4.
pub(crate) fn parse_hex_ip(h: &str) -> Option<String> {
    match h.len() {
        8 => {
            let b = decode_hex(h)?;
            Some(Ipv4Addr::new(b[3], b[2], b[1], b[0]).to_string())
        }
        32 => {
            let le = decode_hex(h)?;
            let mut b = [0u8; 16];
            for (word, chunk) in le.chunks(4).enumerate() {
                for i in 0..4 {
                    b[word * 4 + i] = chunk[3 - i];
                }
            }
            let v6 = Ipv6Addr::from(b);
            match v6.to_ipv4_mapped() {
                Some(v4) => Some(v4.to_string()),
                None => Some(v6.to_string()),
            }
        }
        _ => None,
    }
}

fn decode_hex(h: &str) -> Option<Vec<u8>> {
    if h.len() % 2 != 0 {
        return None;
    }
    h.as_bytes()
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

fn is_loopback(ip: &str) -> bool {
    ip.parse::<IpAddr>().map(|p| p.is_loopback()).unwrap_or(false)
}

fn is_unspecified(ip: &str) -> bool {
    ip.parse::<IpAddr>()
        .map(|p| p.is_unspecified())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:13AD 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0101A8C0:D4F2 220ED8AE:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 54321 1 0000000000000000 100 0 0 10 0
   2: 0101A8C0:C350 4E46C8AC:0050 01 00000000:00000000 00:00000000 00000000  1000        0 54322 1 0000000000000000 100 0 0 10 0";

    #[test]
    fn parses_tcp_table_skipping_listeners() {
        let mut p = ProcNetParser::new("device1");
        let conns = p.parse_table(TCP_TABLE, Protocol::Tcp, 42);

        // Row 0 is a wildcard listener and is dropped.
        assert_eq!(conns.len(), 2);

        let c = &conns[0];
        assert_eq!(c.serial, "device1");
        assert_eq!(c.local_ip, "192.168.1.1");
        assert_eq!(c.local_port, 54514);
        assert_eq!(c.remote_ip, "174.216.14.34");
        assert_eq!(c.remote_port, 443);
        assert_eq!(c.state, ConnState::Established);
        assert_eq!(c.uid, 1000);
        assert_eq!(c.first_seen, 42);

        let c2 = &conns[1];
        assert_eq!(c2.remote_ip, "172.200.70.78");
        assert_eq!(c2.remote_port, 80);
        assert_eq!(c2.state, ConnState::Established);
    }

    #[test]
    fn empty_and_header_only_inputs_yield_nothing() {
        let mut p = ProcNetParser::new("dev1");
        assert!(p.parse_table("", Protocol::Tcp, 0).is_empty());
        assert!(
            p.parse_table("  sl  local_address rem_address   st", Protocol::Tcp, 0)
                .is_empty()
        );
    }

    #[test]
    fn loopback_to_loopback_is_dropped() {
        let line = "   3: 0100007F:1F90 0100007F:D431 01 00000000:00000000 00:00000000 00000000  1000        0 999 1 0 100 0 0 10 0";
        let mut p = ProcNetParser::new("dev1");
        assert!(p.parse_table(line, Protocol::Tcp, 0).is_empty());
    }

    #[test]
    fn hex_ip_v4_endianness() {
        assert_eq!(parse_hex_ip("0100007F").unwrap(), "127.0.0.1");
        assert_eq!(parse_hex_ip("00000000").unwrap(), "0.0.0.0");
        assert_eq!(parse_hex_ip("0101A8C0").unwrap(), "192.168.1.1");
    }

    #[test]
    fn hex_ip_v6_and_mapped_v4() {
        // ::1 in /proc/net/tcp6 word encoding.
        assert_eq!(
            parse_hex_ip("00000000000000000000000001000000").unwrap(),
            "::1"
        );
        // ::ffff:174.216.14.34 normalizes to the IPv4 form.
        assert_eq!(
            parse_hex_ip("0000000000000000FFFF0000220ED8AE").unwrap(),
            "174.216.14.34"
        );
    }

    #[test]
    fn hex_ip_rejects_odd_lengths() {
        assert!(parse_hex_ip("0100007").is_none());
        assert!(parse_hex_ip("zz00007F").is_none());
        assert!(parse_hex_ip("").is_none());
    }

    #[test]
    fn hex_addr_splits_ip_and_port() {
        let (ip, port) = parse_hex_addr("0101A8C0:01BB").unwrap();
        assert_eq!(ip, "192.168.1.1");
        assert_eq!(port, 443);
        assert!(parse_hex_addr("0101A8C0").is_none());
    }
}
