use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// L4 protocol carried by a front address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// IANA protocol number, as found in the IPv4 header.
    pub const fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    pub const fn from_number(number: u8) -> Option<Protocol> {
        match number {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown L4 protocol: {other}")),
        }
    }
}

/// Which Minecraft variant an endpoint serves. The kind pins the L4
/// protocol: Java is TCP, Bedrock is UDP (RakNet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Java,
    Bedrock,
}

impl EndpointKind {
    pub const fn protocol(self) -> Protocol {
        match self {
            EndpointKind::Java => Protocol::Tcp,
            EndpointKind::Bedrock => Protocol::Udp,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Java => write!(f, "java"),
            EndpointKind::Bedrock => write!(f, "bedrock"),
        }
    }
}

impl FromStr for EndpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "java" => Ok(EndpointKind::Java),
            "bedrock" => Ok(EndpointKind::Bedrock),
            other => Err(format!("unknown endpoint kind: {other}")),
        }
    }
}

/// A protected endpoint. The front address is advertised to clients; the
/// origin stays hidden behind the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub kind: EndpointKind,
    pub front_ip: Ipv4Addr,
    pub front_port: u16,
    pub origin_ip: Ipv4Addr,
    pub origin_port: u16,
    /// Steady refill, packets per second per source.
    pub rate_limit: u32,
    /// Token bucket capacity. Always >= `rate_limit`.
    pub burst_limit: u32,
    /// When set, every packet for this endpoint is dropped.
    pub maintenance: bool,
    pub active: bool,
}

impl Endpoint {
    /// Key of this endpoint in the front-address table.
    pub fn front_key(&self) -> u64 {
        front_key(u32::from(self.front_ip), self.front_port, self.kind.protocol())
    }
}

/// Packs a front (ip, port, L4) into the endpoint table key. The full
/// triple is the endpoint identity: the same ip:port may be protected over
/// TCP and UDP independently.
pub fn front_key(ip: u32, port: u16, protocol: Protocol) -> u64 {
    let l4_bit = match protocol {
        Protocol::Tcp => 0,
        Protocol::Udp => 1,
    };
    ((ip as u64) << 17) | ((port as u64) << 1) | l4_bit
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn front_key_separates_the_triple() {
        let key = front_key(0x01020304, 25565, Protocol::Tcp);
        assert_ne!(key, front_key(0x01020304, 25565, Protocol::Udp));
        assert_ne!(key, front_key(0x01020304, 25566, Protocol::Tcp));
        assert_ne!(key, front_key(0x01020305, 25565, Protocol::Tcp));
        assert_eq!(key, front_key(0x01020304, 25565, Protocol::Tcp));
    }
}
