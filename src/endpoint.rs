use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// An address as peers and the rendezvous registry see it.
///
/// A port of 0 means the external port is unknown; the locally bound port is
/// used in its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn has_port(&self) -> bool {
        self.port != 0
    }

    /// Keep the ip, replace an unknown port with `port`.
    pub fn or_port(self, port: u16) -> Self {
        if self.has_port() {
            self
        } else {
            Self { ip: self.ip, port }
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Coarse NAT behaviour reported by a STUN probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NatType {
    Open,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    SymmetricFirewall,
    Blocked,
    Unknown,
}

impl NatType {
    /// Parse the classification strings STUN tools print.
    pub fn classify(s: &str) -> Self {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "open internet" | "open" | "none" => NatType::Open,
            "full cone" | "full cone nat" => NatType::FullCone,
            "restric nat" | "restricted cone" | "restricted cone nat" | "restricted nat" => {
                NatType::RestrictedCone
            }
            "restric port nat" | "port restricted cone" | "port restricted cone nat"
            | "port restricted nat" => NatType::PortRestrictedCone,
            "symmetric nat" | "symmetric" => NatType::Symmetric,
            "symmetric udp firewall" => NatType::SymmetricFirewall,
            "blocked" => NatType::Blocked,
            _ => NatType::Unknown,
        }
    }

    /// The external port changes per destination, so the directed punch is unlikely
    /// to land and a port scan is the better bet.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, NatType::Symmetric | NatType::SymmetricFirewall)
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::Open => "Open Internet",
            NatType::FullCone => "Full Cone",
            NatType::RestrictedCone => "Restricted Cone",
            NatType::PortRestrictedCone => "Port Restricted Cone",
            NatType::Symmetric => "Symmetric NAT",
            NatType::SymmetricFirewall => "Symmetric UDP Firewall",
            NatType::Blocked => "Blocked",
            NatType::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}
