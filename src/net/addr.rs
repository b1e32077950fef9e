//! Peer address book entries exchanged during rendezvous and dialing.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::net::stun::NatType;

/// Capability bits advertised by a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    /// Willing to carry tunnels for private nodes.
    pub relay: bool,
    /// Accepts scheduled work.
    pub worker: bool,
}

/// Externally visible address of a peer, plus what we learned about its NAT
/// situation when it was discovered via STUN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
    /// Scope zone for link-local IPv6 addresses, empty otherwise.
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub nat_type: NatType,
    #[serde(default)]
    pub capabilities: PeerCapabilities,
}

impl PeerAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            zone: String::new(),
            nat_type: NatType::Unknown,
            capabilities: PeerCapabilities::default(),
        }
    }

    pub fn with_nat_type(mut self, nat_type: NatType) -> Self {
        self.nat_type = nat_type;
        self
    }

    pub fn with_capabilities(mut self, capabilities: PeerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.zone.is_empty() {
            write!(f, "{}:{}", self.ip, self.port)
        } else {
            write!(f, "{}%{}:{}", self.ip, self.zone, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_omits_empty_zone() {
        let addr = PeerAddr::new("10.0.0.1".parse().unwrap(), 11451);
        assert_eq!(addr.to_string(), "10.0.0.1:11451");
    }

    #[test]
    fn from_socket_addr() {
        let sa: SocketAddr = "192.168.1.5:8000".parse().unwrap();
        let addr = PeerAddr::from(sa);
        assert_eq!(addr.socket_addr(), sa);
        assert_eq!(addr.nat_type, NatType::Unknown);
        assert!(!addr.capabilities.relay);
    }
}
