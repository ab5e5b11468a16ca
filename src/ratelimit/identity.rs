//! Admission-control identity derivation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Address used when no client address can be resolved.
pub const FALLBACK_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The caller a request is counted against.
///
/// Authenticated requests are limited per subject so that many users behind
/// one NAT do not share an allowance; anonymous traffic (login attempts, for
/// instance) is limited per client address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Subject identifier set by the upstream authentication step
    Subject(String),
    /// Normalized client address
    Address(IpAddr),
}

impl Identity {
    /// Derive the identity from an optional subject and client address.
    pub fn derive(subject: Option<&str>, address: Option<IpAddr>) -> Self {
        match subject.map(str::trim).filter(|s| !s.is_empty()) {
            Some(subject) => Identity::Subject(subject.to_string()),
            None => Identity::Address(address.map(normalize_address).unwrap_or(FALLBACK_ADDRESS)),
        }
    }

    /// The string handed to the limiter.
    pub fn to_string_key(&self) -> String {
        match self {
            Identity::Subject(subject) => subject.clone(),
            Identity::Address(addr) => addr.to_string(),
        }
    }

    pub fn subject(&self) -> Option<&str> {
        match self {
            Identity::Subject(subject) => Some(subject),
            Identity::Address(_) => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Collapse an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to plain IPv4.
pub fn normalize_address(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
