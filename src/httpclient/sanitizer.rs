//! Destination address policy
//!
//! Decides whether the client may open a connection to an address.
//! Explicit allow ranges win, explicit block ranges come next, and
//! finally the IANA special-purpose registries for IPv4 and IPv6 reject
//! everything that is not globally routable.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use lazy_static::lazy_static;
use thiserror::Error;

use crate::error::AppError;

/// Address rejected by the sanitizer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("reserved network address: {addr}")]
pub struct ReservedAddr {
    /// The rejected address as it was presented
    pub addr: String,
}

impl ReservedAddr {
    fn new(addr: impl ToString) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

// IANA IPv4 Special-Purpose Address Registry.
const RESERVED_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),       // "this" network
    (Ipv4Addr::new(10, 0, 0, 0), 8),      // private-use
    (Ipv4Addr::new(100, 64, 0, 0), 10),   // shared address space
    (Ipv4Addr::new(127, 0, 0, 0), 8),     // loopback
    (Ipv4Addr::new(169, 254, 0, 0), 16),  // link local
    (Ipv4Addr::new(172, 16, 0, 0), 12),   // private-use
    (Ipv4Addr::new(192, 0, 0, 0), 24),    // IETF protocol assignments
    (Ipv4Addr::new(192, 0, 2, 0), 24),    // documentation (TEST-NET-1)
    (Ipv4Addr::new(192, 31, 196, 0), 24), // AS112-v4
    (Ipv4Addr::new(192, 52, 193, 0), 24), // AMT
    (Ipv4Addr::new(192, 88, 99, 0), 24),  // deprecated 6to4 relay anycast
    (Ipv4Addr::new(192, 168, 0, 0), 16),  // private-use
    (Ipv4Addr::new(192, 175, 48, 0), 24), // direct delegation AS112
    (Ipv4Addr::new(198, 18, 0, 0), 15),   // benchmarking
    (Ipv4Addr::new(198, 51, 100, 0), 24), // documentation (TEST-NET-2)
    (Ipv4Addr::new(203, 0, 113, 0), 24),  // documentation (TEST-NET-3)
    (Ipv4Addr::new(224, 0, 0, 0), 4),     // multicast
    (Ipv4Addr::new(240, 0, 0, 0), 4),     // reserved, includes limited broadcast
];

// IANA IPv6 Special-Purpose Address Registry.
const RESERVED_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 128), // unspecified
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128), // loopback
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), 96), // IPv4-mapped
    (Ipv6Addr::new(0, 0, 0, 0, 0xffff, 0, 0, 0), 96), // IPv4-translated
    (Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0), 96), // IPv4-IPv6 translation
    (Ipv6Addr::new(0x64, 0xff9b, 1, 0, 0, 0, 0, 0), 48), // NAT64 local-use
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64), // discard-only
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 23), // IETF protocol assignments
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32), // documentation
    (Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16), // 6to4
    (Ipv6Addr::new(0x3fff, 0, 0, 0, 0, 0, 0, 0), 20), // documentation
    (Ipv6Addr::new(0x5f00, 0, 0, 0, 0, 0, 0, 0), 16), // segment routing SIDs
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7), // unique-local
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10), // link-local unicast
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8), // multicast
];

lazy_static! {
    static ref RESERVED_RANGES: Vec<IpNetwork> = RESERVED_V4
        .iter()
        .filter_map(|(addr, prefix)| Ipv4Network::new(*addr, *prefix).ok())
        .map(IpNetwork::V4)
        .chain(
            RESERVED_V6
                .iter()
                .filter_map(|(addr, prefix)| Ipv6Network::new(*addr, *prefix).ok())
                .map(IpNetwork::V6),
        )
        .collect();
}

/// IP admission policy guarding outbound connections
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    allow: Vec<IpNetwork>,
    block: Vec<IpNetwork>,
}

impl Sanitizer {
    /// Create a sanitizer from already-parsed ranges
    pub fn new(allow: Vec<IpNetwork>, block: Vec<IpNetwork>) -> Self {
        Self { allow, block }
    }

    /// Create a sanitizer from CIDR strings (e.g. `"10.0.0.0/8"`)
    ///
    /// # Errors
    /// Returns `AppError::Config` naming the first range that fails to parse
    pub fn from_ranges(allow: &[String], block: &[String]) -> Result<Self, AppError> {
        Ok(Self::new(parse_ranges(allow)?, parse_ranges(block)?))
    }

    /// Decide whether a connection to `ip` is permitted
    pub fn decide(&self, ip: IpAddr) -> Result<(), ReservedAddr> {
        let unmapped = unmap(ip);

        if matches_any(&self.allow, ip, unmapped) {
            return Ok(());
        }

        if matches_any(&self.block, ip, unmapped) {
            return Err(ReservedAddr::new(ip));
        }

        if matches_any(&RESERVED_RANGES, ip, unmapped) {
            return Err(ReservedAddr::new(ip));
        }

        Ok(())
    }

    /// Decide for an address string as handed to a dialer
    ///
    /// Accepts `ip:port`, `[v6]:port` or a bare IP. Anything that does not
    /// parse as an address is rejected.
    pub fn decide_addr(&self, addr: &str) -> Result<IpAddr, ReservedAddr> {
        let ip = addr
            .parse::<SocketAddr>()
            .map(|socket| socket.ip())
            .or_else(|_| addr.trim_matches(['[', ']']).parse::<IpAddr>())
            .map_err(|_| ReservedAddr::new(addr))?;

        self.decide(ip).map(|()| ip)
    }
}

fn parse_ranges(ranges: &[String]) -> Result<Vec<IpNetwork>, AppError> {
    ranges
        .iter()
        .map(|range| {
            range.trim().parse::<IpNetwork>().map_err(|e| {
                AppError::Config(format!("invalid CIDR range {:?}: {}", range, e))
            })
        })
        .collect()
}

/// IPv4 view of an IPv4-mapped IPv6 address, if it is one
fn unmap(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
        IpAddr::V4(_) => None,
    }
}

fn matches_any(ranges: &[IpNetwork], ip: IpAddr, unmapped: Option<IpAddr>) -> bool {
    ranges
        .iter()
        .any(|range| range.contains(ip) || unmapped.is_some_and(|v4| range.contains(v4)))
}
