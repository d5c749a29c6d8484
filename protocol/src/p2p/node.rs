//! # Node Identity & Addressing
//!
//! `NodeId` is the keccak256 of a node's public key and never changes for
//! the lifetime of that key. A `Node` pairs the id with one reachable
//! endpoint; the same id may appear with different endpoints over time
//! (public address, LAN address), but the routing table only keeps one.
//!
//! XOR distance helpers for the Kademlia table live here as well, since
//! they are pure functions of two ids.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Instant;

use crate::config::NODE_ID_LENGTH;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// 32-byte node identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LENGTH]);

impl NodeId {
    pub const fn zero() -> Self {
        Self([0u8; NODE_ID_LENGTH])
    }

    /// A uniformly random id. Used for lookup targets and DB seeks.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8; NODE_ID_LENGTH] {
        &mut self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse 64 hex characters, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| format!("invalid node id hex: {e}"))?;
        let arr: [u8; NODE_ID_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("node id must be {NODE_ID_LENGTH} bytes"))?;
        Ok(Self(arr))
    }

    /// Short form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; NODE_ID_LENGTH]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

// ---------------------------------------------------------------------------
// Distance
// ---------------------------------------------------------------------------

/// Logarithmic XOR distance `log2(a ^ b)`, in `0..=256`.
pub fn log_dist(a: &NodeId, b: &NodeId) -> usize {
    let mut lz = 0usize;
    for (x, y) in a.0.iter().zip(b.0.iter()) {
        let d = x ^ y;
        if d == 0 {
            lz += 8;
        } else {
            lz += d.leading_zeros() as usize;
            break;
        }
    }
    NODE_ID_LENGTH * 8 - lz
}

/// Compares `a -> target` with `b -> target`.
///
/// `Less` means `a` is closer.
pub fn dist_cmp(target: &NodeId, a: &NodeId, b: &NodeId) -> std::cmp::Ordering {
    for i in 0..NODE_ID_LENGTH {
        let da = a.0[i] ^ target.0[i];
        let db = b.0[i] ^ target.0[i];
        if da != db {
            return da.cmp(&db);
        }
    }
    std::cmp::Ordering::Equal
}

// ---------------------------------------------------------------------------
// Endpoint & Node
// ---------------------------------------------------------------------------

/// Where a node can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }
}

/// A remote node as known to discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl Node {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self { id, endpoint }
    }

    pub fn ip(&self) -> IpAddr {
        self.endpoint.ip
    }

    /// Rejects multicast and unspecified addresses and zero ports.
    pub fn validate_complete(&self) -> Result<(), String> {
        let ip = self.endpoint.ip;
        if ip.is_multicast() || ip.is_unspecified() {
            return Err(format!("invalid ip (multicast/unspecified): {ip}"));
        }
        if self.endpoint.udp_port == 0 || self.endpoint.tcp_port == 0 {
            return Err("missing port".to_string());
        }
        Ok(())
    }
}

/// Parses `<hex id>@<ip>:<tcp port>[:<udp port>]`. The UDP port defaults to
/// the TCP port.
impl FromStr for Node {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s.split_once('@').ok_or_else(|| format!("missing '@' in {s}"))?;
        let id = NodeId::from_hex(id)?;

        let (host, udp) = match addr.parse::<SocketAddr>() {
            Ok(sock) => (sock, None),
            Err(_) => {
                let (head, udp) = addr
                    .rsplit_once(':')
                    .ok_or_else(|| format!("invalid address {addr}"))?;
                let sock = head
                    .parse::<SocketAddr>()
                    .map_err(|e| format!("invalid address {head}: {e}"))?;
                let udp = udp.parse::<u16>().map_err(|e| format!("invalid udp port {udp}: {e}"))?;
                (sock, Some(udp))
            }
        };
        let udp = udp.unwrap_or(host.port());
        Ok(Node::new(id, Endpoint::new(host.ip(), udp, host.port())))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.id.short(),
            self.endpoint.ip,
            self.endpoint.tcp_port,
            self.endpoint.udp_port
        )
    }
}

/// A routing table entry: a node plus the bookkeeping the table needs.
///
/// `liveness_checks` only grows; a failed check removes the entry instead of
/// resetting the counter.
#[derive(Debug, Clone)]
pub struct TableNode {
    pub node: Node,
    pub added_at: Instant,
    pub liveness_checks: u32,
}

impl TableNode {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            added_at: Instant::now(),
            liveness_checks: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }
}
