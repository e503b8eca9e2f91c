//! NAT classification.
//!
//! A node learns how it is reachable by sending probes to a rendezvous server on
//! several endpoints and comparing the source address the server observed for
//! each of them. [`classify`] turns those observations into a [`NatType`].
//!
//! # Examples
//!
//! ```rust
//! use zvnet_core::nat::{classify, NatType, Observation};
//!
//! let probes = [
//!     Observation::new("1.1.1.1:3000".parse().unwrap(), "8.8.8.8:40000".parse().unwrap()),
//!     Observation::new("1.1.1.1:3001".parse().unwrap(), "8.8.8.8:40000".parse().unwrap()),
//! ];
//! assert_eq!(classify(None, &probes), NatType::Full);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// How the local endpoint is mapped by intervening NAT devices.
///
/// The discriminants are part of the callback contract and never change.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum NatType {
    #[default]
    Unknown = 0,
    /// Endpoint-independent mapping: same external ip:port for every destination.
    Full = 1,
    /// No translation, the host is directly reachable.
    Host = 2,
    /// External port depends on the destination ip only.
    Fixed = 3,
    /// External port depends on the destination ip and port.
    Symmetric = 4,
    /// More than one external ip observed.
    MultiIp = 5,
}

impl NatType {
    /// Hole punching is unlikely to succeed, prefer the relay.
    #[inline]
    pub fn prefers_relay(&self) -> bool {
        matches!(self, NatType::Symmetric | NatType::MultiIp)
    }
}

impl From<u32> for NatType {
    fn from(value: u32) -> Self {
        match value {
            1 => NatType::Full,
            2 => NatType::Host,
            3 => NatType::Fixed,
            4 => NatType::Symmetric,
            5 => NatType::MultiIp,
            _ => NatType::Unknown,
        }
    }
}

impl From<NatType> for u32 {
    fn from(value: NatType) -> Self {
        value as u32
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NatType::Unknown => "unknown",
            NatType::Full => "full",
            NatType::Host => "host",
            NatType::Fixed => "fixed",
            NatType::Symmetric => "symmetric",
            NatType::MultiIp => "multi-ip",
        };
        f.write_str(name)
    }
}

/// One probe result: where the probe was sent and the source address the
/// rendezvous server saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Observation {
    pub destination: SocketAddr,
    pub mapped: SocketAddr,
}

impl Observation {
    pub fn new(destination: SocketAddr, mapped: SocketAddr) -> Self {
        Self {
            destination,
            mapped,
        }
    }
}

/// Classifies the local NAT from probe observations.
///
/// `local` is the address the probing socket is bound to, when it is known to be
/// a concrete interface address. Only the first observation per destination is
/// considered. A single destination is enough to detect `host` and `multi-ip`
/// but not to tell cone from symmetric mappings, in which case `unknown` is returned.
pub fn classify(local: Option<SocketAddr>, observations: &[Observation]) -> NatType {
    let mut unique: Vec<Observation> = Vec::with_capacity(observations.len());
    for observation in observations {
        if !unique
            .iter()
            .any(|v| v.destination == observation.destination)
        {
            unique.push(*observation);
        }
    }
    let Some(first) = unique.first() else {
        return NatType::Unknown;
    };
    let mut ips: Vec<IpAddr> = unique.iter().map(|v| v.mapped.ip()).collect();
    ips.sort();
    ips.dedup();
    if ips.len() > 1 {
        return NatType::MultiIp;
    }
    if let Some(local) = local {
        if !local.ip().is_unspecified() && unique.iter().all(|v| v.mapped == local) {
            return NatType::Host;
        }
    }
    if unique.len() < 2 {
        return NatType::Unknown;
    }
    if unique.iter().all(|v| v.mapped == first.mapped) {
        return NatType::Full;
    }
    for (i, a) in unique.iter().enumerate() {
        for b in &unique[i + 1..] {
            if a.destination.ip() == b.destination.ip() && a.mapped != b.mapped {
                return NatType::Symmetric;
            }
        }
    }
    NatType::Fixed
}
