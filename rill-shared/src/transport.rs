use bytes::BytesMut;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Instant;

/// Type of transport protocol, either UDP or TCP
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportProtocol {
    /// UDP
    #[default]
    UDP,
    /// TCP
    TCP,
}

/// Transport context with local address, peer address and protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
    /// Type of transport protocol, either UDP or TCP
    pub transport_protocol: TransportProtocol,
}

impl Default for TransportContext {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::from_str("0.0.0.0:0").unwrap(),
            peer_addr: SocketAddr::from_str("0.0.0.0:0").unwrap(),
            transport_protocol: TransportProtocol::UDP,
        }
    }
}

/// A generic transmit with [TransportContext]
pub struct TransportMessage<T> {
    /// Received/Sent time
    pub now: Instant,
    /// A transport context with local and peer address
    pub transport: TransportContext,
    /// Message body with generic type
    pub message: T,
}

/// BytesMut type transmit with [TransportContext]
pub type TaggedBytesMut = TransportMessage<BytesMut>;

/// Four Tuple consists of local address and peer address
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FourTuple {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
}

impl From<&TransportContext> for FourTuple {
    fn from(value: &TransportContext) -> Self {
        Self {
            local_addr: value.local_addr,
            peer_addr: value.peer_addr,
        }
    }
}

/// Encodes an IPv4 peer address into the 64-bit fast id used for O(1)
/// connection lookup on the UDP mux hot path.
///
/// Layout: `ip << 16 | port`. IPv6 peers return `None` and fall back to the
/// string-keyed index.
pub fn fast_id_of(addr: &SocketAddr) -> Option<u64> {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let ip = u32::from(v4) as u64;
            Some((ip << 16) | addr.port() as u64)
        }
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_id_v4() {
        let a = SocketAddr::from_str("1.2.3.4:5678").unwrap();
        let id = fast_id_of(&a).unwrap();
        assert_eq!(id >> 16, 0x01020304);
        assert_eq!(id & 0xFFFF, 5678);
    }

    #[test]
    fn test_fast_id_distinct_ports() {
        let a = SocketAddr::from_str("1.2.3.4:1000").unwrap();
        let b = SocketAddr::from_str("1.2.3.4:1001").unwrap();
        assert_ne!(fast_id_of(&a), fast_id_of(&b));
    }

    #[test]
    fn test_fast_id_v6_falls_back() {
        let a = SocketAddr::from_str("[::1]:1000").unwrap();
        assert!(fast_id_of(&a).is_none());
    }
}
