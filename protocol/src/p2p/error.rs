use std::net::{IpAddr, SocketAddr};

use super::bootnode::BootnodeError;
use super::conn::ConnError;
use super::discover::DiscoverError;
use super::handshake::HandshakeError;
use super::node::NodeId;

/// Errors surfaced by the switch and the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Discover(#[from] DiscoverError),

    #[error(transparent)]
    Bootnode(#[from] BootnodeError),

    #[error("duplicate peer id {0}")]
    DuplicatePeerId(NodeId),

    #[error("connect to self: {0}")]
    ConnectToSelf(String),

    #[error("dialed {expected} but reached {got}")]
    UnexpectedId { expected: NodeId, got: NodeId },

    #[error("peer {0} is blacklisted")]
    Blacklisted(NodeId),

    #[error("address {addr} rejected: {reason}")]
    Filtered { addr: SocketAddr, reason: String },

    #[error("inbound limit reached for {ip} ({count} connections)")]
    InboundLimit { ip: IpAddr, count: usize },

    #[error("peer set is full")]
    TooManyPeers,

    #[error("invalid node info: {0}")]
    InvalidNodeInfo(String),

    #[error("incompatible peer: {0}")]
    Incompatible(String),

    #[error("dial {0} timed out")]
    DialTimeout(SocketAddr),

    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("switch is not running")]
    NotRunning,
}

pub type P2pResult<T> = Result<T, P2pError>;

impl P2pError {
    /// Rejections that happen all the time in a healthy network.
    pub fn is_routine(&self) -> bool {
        matches!(self, P2pError::DuplicatePeerId(_) | P2pError::ConnectToSelf(_))
    }
}
