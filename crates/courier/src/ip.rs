// ABOUTME: Classifies IP literals as private, reserved, or publicly routable.
// ABOUTME: Pure table lookups over IPv4 and IPv6 reserved ranges; fails closed on bad input.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use once_cell::sync::Lazy;

/// IPv4 blocks that must never be fetched from.
static RESERVED_V4: Lazy<Vec<Ipv4Net>> = Lazy::new(|| {
    [
        "0.0.0.0/8",          // this network
        "10.0.0.0/8",         // RFC1918
        "100.64.0.0/10",      // carrier-grade NAT
        "127.0.0.0/8",        // loopback
        "169.254.0.0/16",     // link-local, cloud metadata
        "172.16.0.0/12",      // RFC1918
        "192.0.0.0/24",       // IETF protocol assignments
        "192.0.2.0/24",       // TEST-NET-1
        "192.88.99.0/24",     // 6to4 relay anycast
        "192.168.0.0/16",     // RFC1918
        "198.18.0.0/15",      // benchmarking
        "198.51.100.0/24",    // TEST-NET-2
        "203.0.113.0/24",     // TEST-NET-3
        "224.0.0.0/4",        // multicast
        "240.0.0.0/4",        // reserved
        "255.255.255.255/32", // broadcast
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

/// IPv6 prefixes that must never be fetched from.
static RESERVED_V6: Lazy<Vec<Ipv6Net>> = Lazy::new(|| {
    [
        "::/128",        // unspecified
        "::1/128",       // loopback
        "64:ff9b::/96",  // NAT64, embeds IPv4
        "100::/64",      // discard-only
        "2001:db8::/32", // documentation
        "fc00::/7",      // unique local
        "fe80::/10",     // link-local
        "ff00::/8",      // multicast
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

/// Check whether an IP literal string is private or reserved.
///
/// Empty or unparseable input is treated as private.
pub fn is_private_or_reserved(ip: &str) -> bool {
    let trimmed = ip.trim().trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>() {
        Ok(addr) => is_private_ip(&addr),
        Err(_) => true,
    }
}

/// Check if an IP address is in a private/reserved range.
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => is_reserved_v4(ip),
        IpAddr::V6(ip) => is_reserved_v6(ip),
    }
}

fn is_reserved_v4(ip: &Ipv4Addr) -> bool {
    RESERVED_V4.iter().any(|net| net.contains(ip))
}

fn is_reserved_v6(ip: &Ipv6Addr) -> bool {
    // ::ffff:a.b.c.d and ::a.b.c.d carry an IPv4 destination
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_reserved_v4(&v4);
    }
    let segments = ip.segments();
    if segments[..6].iter().all(|s| *s == 0) && !ip.is_loopback() && !ip.is_unspecified() {
        let [a, b] = segments[6].to_be_bytes();
        let [c, d] = segments[7].to_be_bytes();
        return is_reserved_v4(&Ipv4Addr::new(a, b, c, d));
    }
    RESERVED_V6.iter().any(|net| net.contains(ip))
}
