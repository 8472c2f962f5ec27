use std::net::{IpAddr, Ipv6Addr};

/// Returns `true` for addresses that can never have a public DNS name:
/// RFC1918 ranges, loopback, link-local, and the IPv6 unique-local and
/// link-local ranges.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || is_unique_local(v6)
                || is_unicast_link_local(v6)
        }
    }
}

/// Parses `s` and returns `true` only for a valid, public, specified
/// address. Unparseable input is not public.
pub fn is_public_ip_str(s: &str) -> bool {
    match s.parse::<IpAddr>() {
        Ok(ip) => !is_private_ip(&ip),
        Err(_) => false,
    }
}

// fc00::/7
fn is_unique_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_unicast_link_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}
