//! Address classification and netmask arithmetic.
//!
//! These predicates decide whether an address may appear in a generated
//! service configuration. IPv4 tests run on the 32-bit host-order value of
//! the address, IPv6 tests on the 128-bit value built from its two 64-bit
//! halves.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_LOOPBACK_MASK: u32 = 0x7f00_0000;
const IPV4_CLASS_MASK: u32 = 0xf000_0000;
const IPV4_MULTICAST: u32 = 0xe000_0000;
const IPV4_EXPERIMENTAL: u32 = 0xf000_0000;
const IPV4_LOW_OCTET: u32 = 0x0000_00ff;

const IPV6_SCOPE_MASK: u128 = 0xfec0_0000_0000_0000_0000_0000_0000_0000;
const IPV6_SITE_LOCAL: u128 = 0xfec0_0000_0000_0000_0000_0000_0000_0000;
const IPV6_LINK_LOCAL: u128 = 0xfe80_0000_0000_0000_0000_0000_0000_0000;
const IPV6_MULTICAST_MASK: u128 = 0xff00_0000_0000_0000_0000_0000_0000_0000;

/// Address family of a textual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    IPv4,
    IPv6,
    Invalid,
}

/// Classifies `address` by attempting IPv4 first, then IPv6.
pub fn classify(address: &str) -> AddressFamily {
    match parse(address) {
        Some(IpAddr::V4(_)) => AddressFamily::IPv4,
        Some(IpAddr::V6(_)) => AddressFamily::IPv6,
        None => AddressFamily::Invalid,
    }
}

fn parse(address: &str) -> Option<IpAddr> {
    if let Ok(v4) = address.parse::<Ipv4Addr>() {
        return Some(IpAddr::V4(v4));
    }
    address.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
}

fn parse_v4(address: &str) -> Option<u32> {
    address.parse::<Ipv4Addr>().ok().map(u32::from)
}

fn ipv6_to_int(address: Ipv6Addr) -> u128 {
    let octets = address.octets();
    let mut high = [0u8; 8];
    let mut low = [0u8; 8];
    high.copy_from_slice(&octets[..8]);
    low.copy_from_slice(&octets[8..]);
    (u128::from(u64::from_be_bytes(high)) << 64) | u128::from(u64::from_be_bytes(low))
}

/// Returns true if `address` is an IPv4 or IPv6 address usable by a client.
///
/// IPv4 addresses must pass [`is_valid_ipv4`], IPv6 addresses must be
/// global unicast. Anything unparsable is rejected.
pub fn is_valid_ip_address(address: &str) -> bool {
    match parse(address) {
        Some(IpAddr::V4(v4)) => is_valid_ipv4_int(u32::from(v4)),
        Some(IpAddr::V6(v6)) => is_valid_ipv6_int(ipv6_to_int(v6)),
        None => false,
    }
}

/// Rejects broadcast, loopback, multicast, experimental, all-zero,
/// network (`x.x.x.0`) and subnet broadcast (`x.x.x.255`) addresses.
pub fn is_valid_ipv4(address: &str) -> bool {
    parse_v4(address).is_some_and(is_valid_ipv4_int)
}

fn is_valid_ipv4_int(ip: u32) -> bool {
    let broadcast = ip == u32::MAX;
    let loopback = ip & IPV4_LOOPBACK_MASK == IPV4_LOOPBACK_MASK;
    let multicast = ip & IPV4_CLASS_MASK == IPV4_MULTICAST;
    let experimental = ip & IPV4_CLASS_MASK == IPV4_EXPERIMENTAL;
    let unspecified = ip == 0;
    let subnet_broadcast = ip & IPV4_LOW_OCTET == IPV4_LOW_OCTET;
    let network = ip & IPV4_LOW_OCTET == 0;

    !(broadcast
        || loopback
        || multicast
        || experimental
        || unspecified
        || subnet_broadcast
        || network)
}

/// Rejects unspecified, loopback, site-local, multicast and link-local
/// IPv6 addresses.
pub fn is_valid_ipv6_global_unicast(address: &str) -> bool {
    address
        .parse::<Ipv6Addr>()
        .is_ok_and(|v6| is_valid_ipv6_int(ipv6_to_int(v6)))
}

fn is_valid_ipv6_int(ip: u128) -> bool {
    let unspecified = ip == 0;
    let loopback = ip == 1;
    let site_local = ip & IPV6_SCOPE_MASK == IPV6_SITE_LOCAL;
    let multicast = ip & IPV6_MULTICAST_MASK == IPV6_MULTICAST_MASK;
    let link_local = ip & IPV6_SCOPE_MASK == IPV6_LINK_LOCAL;

    !(unspecified || loopback || site_local || multicast || link_local)
}

/// A netmask is valid when its leading bits are a contiguous run of ones,
/// i.e. its two's-complement negation has exactly one bit set.
pub fn is_valid_netmask(mask: &str) -> bool {
    parse_v4(mask).is_some_and(|mask| mask.wrapping_neg().count_ones() == 1)
}

/// Returns true when `start` and `end` fall in the same network under `netmask`.
///
/// Unparsable inputs never share a network.
pub fn same_network(start: &str, end: &str, netmask: &str) -> bool {
    match (parse_v4(start), parse_v4(end), parse_v4(netmask)) {
        (Some(start), Some(end), Some(mask)) => start & mask == end & mask,
        _ => false,
    }
}

/// Computes `start | !netmask`, the all-ones host address of the network.
pub fn expected_broadcast(start: &str, netmask: &str) -> Option<Ipv4Addr> {
    let start = parse_v4(start)?;
    let mask = parse_v4(netmask)?;
    Some(Ipv4Addr::from(start | !mask))
}

/// Checks `candidate` against [`expected_broadcast`].
pub fn is_valid_broadcast(start: &str, netmask: &str, candidate: &str) -> bool {
    match (expected_broadcast(start, netmask), parse_v4(candidate)) {
        (Some(expected), Some(candidate)) => u32::from(expected) == candidate,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("10.0.0.1"), AddressFamily::IPv4);
        assert_eq!(classify("2001:db8::1"), AddressFamily::IPv6);
        assert_eq!(classify("::ffff:10.0.0.1"), AddressFamily::IPv6);
        assert_eq!(classify("10.0.0"), AddressFamily::Invalid);
        assert_eq!(classify("hostname"), AddressFamily::Invalid);
        assert_eq!(classify(""), AddressFamily::Invalid);
    }

    #[test]
    fn test_ipv4_reserved_ranges() {
        assert!(is_valid_ipv4("192.168.0.1"));
        assert!(is_valid_ipv4("10.0.0.254"));

        assert!(!is_valid_ipv4("255.255.255.255"));
        assert!(!is_valid_ipv4("127.0.0.1"));
        assert!(!is_valid_ipv4("224.0.0.5"));
        assert!(!is_valid_ipv4("239.1.2.3"));
        assert!(!is_valid_ipv4("240.1.2.3"));
        assert!(!is_valid_ipv4("0.0.0.0"));
        assert!(!is_valid_ipv4("192.168.1.0"));
        assert!(!is_valid_ipv4("192.168.1.255"));
        assert!(!is_valid_ipv4("2001:db8::1"));
    }

    #[test]
    fn test_ipv6_global_unicast() {
        assert!(is_valid_ipv6_global_unicast("2001:db8::1"));
        assert!(is_valid_ipv6_global_unicast("2620:0:1cfe:face:b00c::3"));

        assert!(!is_valid_ipv6_global_unicast("::"));
        assert!(!is_valid_ipv6_global_unicast("::1"));
        assert!(!is_valid_ipv6_global_unicast("fec0::1"));
        assert!(!is_valid_ipv6_global_unicast("ff02::1"));
        assert!(!is_valid_ipv6_global_unicast("fe80::1"));
        assert!(!is_valid_ipv6_global_unicast("10.0.0.1"));
    }

    #[test]
    fn test_is_valid_ip_address_dispatches_on_family() {
        assert!(is_valid_ip_address("10.0.0.1"));
        assert!(is_valid_ip_address("2001:db8::10"));
        assert!(!is_valid_ip_address("10.0.0.0"));
        assert!(!is_valid_ip_address("fe80::10"));
        assert!(!is_valid_ip_address("not-an-ip"));
    }

    #[test]
    fn test_netmask() {
        assert!(is_valid_netmask("255.255.255.0"));
        assert!(is_valid_netmask("255.0.0.0"));
        assert!(is_valid_netmask("255.255.255.255"));
        assert!(is_valid_netmask("128.0.0.0"));

        assert!(!is_valid_netmask("255.0.255.0"));
        assert!(!is_valid_netmask("0.0.0.0"));
        assert!(!is_valid_netmask("255.255.255.1"));
        assert!(!is_valid_netmask("ffff::"));
    }

    #[test]
    fn test_same_network() {
        assert!(same_network("10.0.0.1", "10.0.0.254", "255.0.0.0"));
        assert!(same_network("192.168.1.10", "192.168.1.20", "255.255.255.0"));
        assert!(!same_network("192.168.1.10", "192.168.2.20", "255.255.255.0"));
        assert!(!same_network("192.168.1.10", "bogus", "255.255.255.0"));
    }

    #[test]
    fn test_broadcast() {
        assert_eq!(
            expected_broadcast("192.168.0.1", "255.255.255.0"),
            Some(Ipv4Addr::new(192, 168, 0, 255))
        );
        assert!(is_valid_broadcast("192.168.0.1", "255.255.255.0", "192.168.0.255"));
        assert!(!is_valid_broadcast("192.168.0.1", "255.255.255.0", "192.168.0.254"));
        assert!(is_valid_broadcast("10.0.0.1", "255.0.0.0", "10.255.255.255"));
    }
}
