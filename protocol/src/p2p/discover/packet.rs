//! # Discovery Wire Format
//!
//! Every UDP datagram is a fixed header followed by a typed body:
//!
//! ```text
//! +---------+--------------+-----------------+------+------------------+
//! | mac(32) | signature(73)| public key (40) | type | bincode(body)    |
//! +---------+--------------+-----------------+------+------------------+
//! ```
//!
//! - `signature` signs `keccak256(type || body)`.
//! - `mac` is `keccak256(signature || public key || type || body)`; it only
//!   guards against truncation and doubles as the packet's unique hash (a
//!   pong echoes the ping's mac as its reply token).
//! - The sender's [`NodeId`] is derived from the public key, so it never
//!   travels separately.
//!
//! Datagrams are capped at 1280 bytes; a neighbors reply that would exceed
//! the cap is split across several packets.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{UDP_HEAD_SIZE, UDP_MAC_SIZE, UDP_MAX_PACKET_SIZE, UDP_SIG_SIZE};
use crate::crypto::{keccak256, NodeKey, PublicKey, Signature};
use crate::p2p::node::{Endpoint, Node, NodeId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too small")]
    TooSmall,

    #[error("packet exceeds {UDP_MAX_PACKET_SIZE} bytes ({0})")]
    TooLarge(usize),

    #[error("bad hash")]
    BadHash,

    #[error("bad sender key")]
    BadKey,

    #[error("bad signature")]
    BadSignature,

    #[error("unknown packet type {0}")]
    UnknownType(u8),

    #[error("malformed body: {0}")]
    Body(#[from] bincode::Error),
}

// ---------------------------------------------------------------------------
// Body types
// ---------------------------------------------------------------------------

/// Packet discriminator, the first byte after the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Ping = 1,
    Pong = 2,
    FindNode = 3,
    Neighbors = 4,
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            3 => Some(Self::FindNode),
            4 => Some(Self::Neighbors),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEndpoint {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
}

impl RpcEndpoint {
    pub fn from_addr(addr: SocketAddr, tcp: u16) -> Self {
        Self {
            ip: addr.ip(),
            udp: addr.port(),
            tcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcNode {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
    pub id: NodeId,
}

impl From<&Node> for RpcNode {
    fn from(n: &Node) -> Self {
        Self {
            ip: n.endpoint.ip,
            udp: n.endpoint.udp_port,
            tcp: n.endpoint.tcp_port,
            id: n.id,
        }
    }
}

impl From<RpcNode> for Node {
    fn from(r: RpcNode) -> Self {
        Node::new(r.id, Endpoint::new(r.ip, r.udp, r.tcp))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub version: u32,
    pub from: RpcEndpoint,
    pub to: RpcEndpoint,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// The responder's own record, so a pinger learns the id behind an
    /// address it only knew by endpoint.
    pub my_node: RpcNode,
    /// Hash of the ping being answered.
    pub reply_tok: [u8; 32],
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNode {
    pub target: NodeId,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbors {
    pub nodes: Vec<RpcNode>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Ping(_) => PacketKind::Ping,
            Packet::Pong(_) => PacketKind::Pong,
            Packet::FindNode(_) => PacketKind::FindNode,
            Packet::Neighbors(_) => PacketKind::Neighbors,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Ping(_) => "PING",
            Packet::Pong(_) => "PONG",
            Packet::FindNode(_) => "FINDNODE",
            Packet::Neighbors(_) => "NEIGHBORS",
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Packet::Ping(p) => p.expiration,
            Packet::Pong(p) => p.expiration,
            Packet::FindNode(p) => p.expiration,
            Packet::Neighbors(p) => p.expiration,
        }
    }

    fn encode_body(&self) -> bincode::Result<Vec<u8>> {
        match self {
            Packet::Ping(p) => bincode::serialize(p),
            Packet::Pong(p) => bincode::serialize(p),
            Packet::FindNode(p) => bincode::serialize(p),
            Packet::Neighbors(p) => bincode::serialize(p),
        }
    }

    fn decode_body(kind: PacketKind, body: &[u8]) -> bincode::Result<Self> {
        Ok(match kind {
            PacketKind::Ping => Packet::Ping(bincode::deserialize(body)?),
            PacketKind::Pong => Packet::Pong(bincode::deserialize(body)?),
            PacketKind::FindNode => Packet::FindNode(bincode::deserialize(body)?),
            PacketKind::Neighbors => Packet::Neighbors(bincode::deserialize(body)?),
        })
    }
}

/// Unix seconds `secs` from now, for packet expirations.
pub fn expiration_in(secs: u64) -> u64 {
    unix_now() + secs
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether an absolute expiration lies in the past.
pub fn is_expired(expiration: u64) -> bool {
    expiration < unix_now()
}

/// Largest number of nodes a single neighbors packet can carry.
pub fn max_neighbors() -> usize {
    static MAX: OnceLock<usize> = OnceLock::new();
    *MAX.get_or_init(|| {
        let widest = RpcNode {
            ip: IpAddr::V6(Ipv6Addr::from([0xffu8; 16])),
            udp: u16::MAX,
            tcp: u16::MAX,
            id: NodeId::from([0xffu8; 32]),
        };
        let mut p = Neighbors {
            nodes: Vec::new(),
            expiration: u64::MAX,
        };
        loop {
            p.nodes.push(widest);
            let size = bincode::serialized_size(&p).unwrap_or(u64::MAX) as usize;
            if UDP_HEAD_SIZE + 1 + size >= UDP_MAX_PACKET_SIZE {
                return p.nodes.len() - 1;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// A verified, decoded datagram.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub packet: Packet,
    pub from_key: PublicKey,
    pub from_id: NodeId,
    pub hash: [u8; 32],
}

/// Signs and frames `packet`. Returns the datagram and its hash.
pub fn encode(key: &NodeKey, packet: &Packet) -> Result<(Vec<u8>, [u8; 32]), PacketError> {
    let body = packet.encode_body()?;
    let mut buf = vec![0u8; UDP_HEAD_SIZE];
    buf.push(packet.kind() as u8);
    buf.extend_from_slice(&body);
    if buf.len() > UDP_MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge(buf.len()));
    }

    let sig = key.sign(&keccak256(&buf[UDP_HEAD_SIZE..]));
    buf[UDP_MAC_SIZE..UDP_MAC_SIZE + UDP_SIG_SIZE].copy_from_slice(&sig.to_wire());
    buf[UDP_MAC_SIZE + UDP_SIG_SIZE..UDP_HEAD_SIZE].copy_from_slice(&key.public_key().to_wire());

    let hash = keccak256(&buf[UDP_MAC_SIZE..]);
    buf[..UDP_MAC_SIZE].copy_from_slice(&hash);
    Ok((buf, hash))
}

/// Verifies the mac and signature of `buf` and decodes the body.
pub fn decode(buf: &[u8]) -> Result<Decoded, PacketError> {
    if buf.len() < UDP_HEAD_SIZE + 1 {
        return Err(PacketError::TooSmall);
    }
    let mac = &buf[..UDP_MAC_SIZE];
    let sig_slot = &buf[UDP_MAC_SIZE..UDP_MAC_SIZE + UDP_SIG_SIZE];
    let key_slot = &buf[UDP_MAC_SIZE + UDP_SIG_SIZE..UDP_HEAD_SIZE];
    let sigdata = &buf[UDP_HEAD_SIZE..];

    let hash = keccak256(&buf[UDP_MAC_SIZE..]);
    if mac != hash {
        return Err(PacketError::BadHash);
    }
    let from_key = PublicKey::from_wire(key_slot).map_err(|_| PacketError::BadKey)?;
    let sig = Signature::from_wire(sig_slot).map_err(|_| PacketError::BadSignature)?;
    if !from_key.verify(&keccak256(sigdata), &sig) {
        return Err(PacketError::BadSignature);
    }

    let kind = PacketKind::from_byte(sigdata[0]).ok_or(PacketError::UnknownType(sigdata[0]))?;
    let packet = Packet::decode_body(kind, &sigdata[1..])?;
    Ok(Decoded {
        packet,
        from_id: from_key.node_id(),
        from_key,
        hash,
    })
}
