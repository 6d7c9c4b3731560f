//! Source-address allow-lists for platform callbacks.
//!
//! A list is comma separated. Each entry is an exact address, an IPv4 pattern
//! with `*` octets (`10.0.*.*`) or a CIDR block (`203.0.113.0/24`).
//! A missing or empty list allows every source.

use std::net::{IpAddr, Ipv4Addr};

pub fn is_allowed(source: Option<IpAddr>, whitelist: Option<&str>) -> bool {
    let entries: Vec<&str> = whitelist
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect();
    if entries.is_empty() {
        return true;
    }
    let Some(source) = source.map(canonical) else {
        return false;
    };
    entries.iter().any(|entry| entry_matches(entry, source))
}

/// `::ffff:a.b.c.d` is the IPv4 peer as seen by a dual-stack listener.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn entry_matches(entry: &str, source: IpAddr) -> bool {
    if let Some((network, prefix)) = entry.split_once('/') {
        return cidr_matches(network, prefix, source);
    }
    if entry.contains('*') {
        return match source {
            IpAddr::V4(v4) => wildcard_matches(entry, v4),
            IpAddr::V6(_) => false,
        };
    }
    entry.parse::<IpAddr>().map(canonical).map(|ip| ip == source).unwrap_or(false)
}

fn wildcard_matches(pattern: &str, source: Ipv4Addr) -> bool {
    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts
        .iter()
        .zip(source.octets())
        .all(|(part, octet)| *part == "*" || part.parse::<u8>().map(|p| p == octet).unwrap_or(false))
}

fn cidr_matches(network: &str, prefix: &str, source: IpAddr) -> bool {
    let Ok(prefix) = prefix.parse::<u32>() else {
        return false;
    };
    match (network.parse::<IpAddr>(), source) {
        (Ok(IpAddr::V4(net)), IpAddr::V4(ip)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (Ok(IpAddr::V6(net)), IpAddr::V6(ip)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn empty_list_allows_everyone() {
        assert!(is_allowed(ip("198.51.100.7"), None));
        assert!(is_allowed(ip("198.51.100.7"), Some("")));
        assert!(is_allowed(None, Some(" , ")));
    }

    #[test]
    fn exact_match() {
        let list = Some("203.0.113.10, 203.0.113.11");
        assert!(is_allowed(ip("203.0.113.11"), list));
        assert!(!is_allowed(ip("203.0.113.12"), list));
        assert!(!is_allowed(None, list));
    }

    #[test]
    fn wildcard_octets() {
        let list = Some("192.168.*.*");
        assert!(is_allowed(ip("192.168.4.20"), list));
        assert!(!is_allowed(ip("192.169.4.20"), list));
        assert!(!is_allowed(ip("192.168.4.20"), Some("192.168.*")));
    }

    #[test]
    fn cidr_blocks() {
        let list = Some("10.1.0.0/16");
        assert!(is_allowed(ip("10.1.200.3"), list));
        assert!(!is_allowed(ip("10.2.0.1"), list));
        assert!(is_allowed(ip("8.8.8.8"), Some("0.0.0.0/0")));
        assert!(is_allowed(ip("10.0.0.1"), Some("10.0.0.1/32")));
        assert!(!is_allowed(ip("10.0.0.1"), Some("10.0.0.0/33")));
        assert!(is_allowed(ip("2001:db8::1"), Some("2001:db8::/32")));
    }

    #[test]
    fn mapped_ipv4_peer_matches_ipv4_entry() {
        assert!(is_allowed(ip("::ffff:203.0.113.10"), Some("203.0.113.10")));
        assert!(is_allowed(ip("::ffff:203.0.113.10"), Some("203.0.113.*")));
    }
}
