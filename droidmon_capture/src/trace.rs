use crate::types::{NetworkPacket, Protocol};
use chrono::{Local, NaiveTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;

// tcpdump -i any -n -l -s 256 -q output:
// 12:34:56.789012 IP 10.0.0.1.12345 > 93.184.216.34.80: tcp 100
// 12:34:56.789012 IP 10.0.0.1.12345 > 8.8.8.8.53: UDP, length 40
// 12:34:56.789012 IP6 ::1.12345 > ::1.80: tcp 100
//
// With -A (ASCII dump) HTTP headers follow on their own lines:
// GET /api/users HTTP/1.1
// Host: example.com

static RE_PACKET_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{2}:\d{2}:\d{2}\.\d+)\s+(IP6?)\s+(\S+)\.(\d+)\s+>\s+(\S+)\.(\d+):\s+(.+)$",
    )
    .expect("packet line pattern")
});

static RE_HTTP_REQUEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(GET|POST|PUT|DELETE|PATCH|HEAD|OPTIONS|CONNECT)\s+(\S+)\s+HTTP/")
        .expect("http request pattern")
});

static RE_HTTP_RESPONSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^HTTP/[\d.]+\s+(\d{3})").expect("http response pattern"));

static RE_HTTP_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^Host:\s*(\S+)").expect("host header pattern"));

/// Parses tcpdump text output into [`NetworkPacket`]s.
pub struct TraceParser {
    serial: String,
    next_id: u64,
}

impl TraceParser {
    /// Creates a parser attributing packets to `serial`.
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            next_id: 0,
        }
    }

    /// Parses a single tcpdump line. Returns `None` if the line is not a
    /// packet header (it may still be an ASCII-dump continuation; see
    /// [`enrich_http`](Self::enrich_http)).
    pub fn parse_line(&mut self, line: &str) -> Option<NetworkPacket> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let m = RE_PACKET_LINE.captures(line)?;
        let rest = m.get(7).map(|r| r.as_str()).unwrap_or("");

        self.next_id += 1;
        Some(NetworkPacket {
            id: format!("{}-{}", self.serial, self.next_id),
            serial: self.serial.clone(),
            timestamp: parse_timestamp(m.get(1).map(|t| t.as_str()).unwrap_or("")),
            src_ip: m[3].to_string(),
            src_port: m[4].parse().unwrap_or(0),
            dst_ip: m[5].to_string(),
            dst_port: m[6].parse().unwrap_or(0),
            protocol: parse_protocol(rest),
            length: parse_length(rest),
            flags: parse_flags(rest),
            raw: line.to_string(),
            ..NetworkPacket::default()
        })
    }

    /// Applies an ASCII-dump line that follows a packet header: request
    /// line, response status line, or `Host:` header.
    pub fn enrich_http(&self, pkt: &mut NetworkPacket, line: &str) {
        let line = line.trim();

        if let Some(m) = RE_HTTP_REQUEST.captures(line) {
            pkt.http_method = m[1].to_string();
            pkt.http_path = m[2].to_string();
            return;
        }
        if let Some(m) = RE_HTTP_RESPONSE.captures(line) {
            pkt.http_status = m[1].parse().unwrap_or(0);
            return;
        }
        if let Some(m) = RE_HTTP_HOST.captures(line) {
            pkt.http_host = m[1].to_string();
        }
    }
}

/// Anchors a `HH:MM:SS.ffffff` capture time to the current local day.
/// Unparseable timestamps fall back to "now".
fn parse_timestamp(s: &str) -> u64 {
    let now = Local::now();
    let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") else {
        return now.timestamp_millis() as u64;
    };
    let stamped = now.date_naive().and_time(time);
    match Local.from_local_datetime(&stamped).single() {
        Some(dt) => dt.timestamp_millis() as u64,
        None => now.timestamp_millis() as u64,
    }
}

fn parse_protocol(rest: &str) -> Protocol {
    let lower = rest.to_lowercase();
    if lower.contains("udp") {
        Protocol::Udp
    } else if lower.contains("icmp") {
        Protocol::Icmp
    } else {
        Protocol::Tcp
    }
}

fn parse_length(rest: &str) -> u32 {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        if *part == "length" && i + 1 < parts.len() {
            return parts[i + 1].parse().unwrap_or(0);
        }
    }
    // tcpdump -q ends the summary with "tcp 100"; only accept a final
    // all-digit token so unrelated trailing fields don't become lengths.
    match parts.last() {
        Some(last) if last.bytes().all(|b| b.is_ascii_digit()) => last.parse().unwrap_or(0),
        _ => 0,
    }
}

fn parse_flags(rest: &str) -> String {
    let Some(start) = rest.find("Flags [") else {
        return String::new();
    };
    let after = &rest[start + 7..];
    match after.find(']') {
        Some(end) => after[..end].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_packet_line() {
        let mut p = TraceParser::new("dev1");
        let pkt = p
            .parse_line("12:34:56.789012 IP 10.0.0.1.12345 > 93.184.216.34.80: tcp 100")
            .expect("packet");
        assert_eq!(pkt.serial, "dev1");
        assert_eq!(pkt.src_ip, "10.0.0.1");
        assert_eq!(pkt.src_port, 12345);
        assert_eq!(pkt.dst_ip, "93.184.216.34");
        assert_eq!(pkt.dst_port, 80);
        assert_eq!(pkt.protocol, Protocol::Tcp);
        assert_eq!(pkt.length, 100);
        assert!(pkt.timestamp > 0);
    }

    #[test]
    fn parses_udp_with_length_keyword() {
        let mut p = TraceParser::new("dev1");
        let pkt = p
            .parse_line("12:34:56.789012 IP 10.0.0.1.12345 > 8.8.8.8.53: UDP, length 40")
            .expect("packet");
        assert_eq!(pkt.protocol, Protocol::Udp);
        assert_eq!(pkt.length, 40);
        assert_eq!(pkt.dst_port, 53);
    }

    #[test]
    fn parses_ipv6_packet_line() {
        let mut p = TraceParser::new("dev1");
        let pkt = p
            .parse_line("01:02:03.000001 IP6 ::1.12345 > ::1.80: tcp 10")
            .expect("packet");
        assert_eq!(pkt.src_ip, "::1");
        assert_eq!(pkt.dst_port, 80);
    }

    #[test]
    fn extracts_tcp_flags() {
        let mut p = TraceParser::new("dev1");
        let pkt = p
            .parse_line(
                "12:34:56.789012 IP 10.0.0.1.12345 > 93.184.216.34.443: Flags [S], seq 1, length 0",
            )
            .expect("packet");
        assert_eq!(pkt.flags, "S");
        assert_eq!(pkt.length, 0);
    }

    #[test]
    fn non_packet_lines_return_none() {
        let mut p = TraceParser::new("dev1");
        assert!(p.parse_line("").is_none());
        assert!(p.parse_line("GET /api/users HTTP/1.1").is_none());
        assert!(p.parse_line("listening on any, link-type LINUX_SLL").is_none());
    }

    #[test]
    fn enriches_http_request_host_and_status() {
        let mut p = TraceParser::new("dev1");
        let mut pkt = p
            .parse_line("12:34:56.789012 IP 10.0.0.1.12345 > 93.184.216.34.80: tcp 100")
            .expect("packet");

        p.enrich_http(&mut pkt, "GET /api/users HTTP/1.1");
        assert_eq!(pkt.http_method, "GET");
        assert_eq!(pkt.http_path, "/api/users");

        p.enrich_http(&mut pkt, "Host: example.com");
        assert_eq!(pkt.http_host, "example.com");

        p.enrich_http(&mut pkt, "HTTP/1.1 204 No Content");
        assert_eq!(pkt.http_status, 204);

        // Arbitrary dump lines leave the packet unchanged.
        p.enrich_http(&mut pkt, "Accept-Encoding: gzip");
        assert_eq!(pkt.http_method, "GET");
    }

    #[test]
    fn unrelated_trailing_token_is_not_a_length() {
        let mut p = TraceParser::new("dev1");
        let pkt = p
            .parse_line("12:34:56.789012 IP 10.0.0.1.1 > 2.2.2.2.80: tcp, bad cksum")
            .expect("packet");
        assert_eq!(pkt.length, 0);
    }

    #[test]
    fn ids_are_sequential_per_parser() {
        let mut p = TraceParser::new("dev1");
        let a = p
            .parse_line("12:00:00.000001 IP 1.1.1.1.1 > 2.2.2.2.2: tcp 1")
            .unwrap();
        let b = p
            .parse_line("12:00:00.000002 IP 1.1.1.1.1 > 2.2.2.2.2: tcp 1")
            .unwrap();
        assert_eq!(a.id, "dev1-1");
        assert_eq!(b.id, "dev1-2");
    }
}
