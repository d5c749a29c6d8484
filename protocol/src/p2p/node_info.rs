//! What two nodes tell each other when they connect.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use super::error::{P2pError, P2pResult};
use super::node::NodeId;
use super::profile::NodeRole;
use crate::config::major_version;
use crate::crypto::PublicKey;

const MAX_NUM_CHANNELS: usize = 16;
const MAX_MONIKER_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub pub_key: PublicKey,
    pub network: String,
    pub version: String,
    /// Channel ids this node has reactors for.
    pub channels: Vec<u8>,
    pub moniker: String,
    pub role: NodeRole,
    /// Advertised `ip:port` of the TCP listener.
    pub listen_addr: String,
    /// Extra `ip:port` strings the node is reachable under. Not
    /// authenticated; only used to spot duplicate connections.
    pub local_addrs: Vec<String>,
}

impl NodeInfo {
    pub fn id(&self) -> NodeId {
        self.pub_key.node_id()
    }

    pub fn listen_socket_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.parse().ok()
    }

    /// Structural checks on a received `NodeInfo`.
    pub fn validate(&self) -> P2pResult<()> {
        if self.channels.len() > MAX_NUM_CHANNELS {
            return Err(P2pError::InvalidNodeInfo(format!(
                "{} channels, max {MAX_NUM_CHANNELS}",
                self.channels.len()
            )));
        }
        let unique: HashSet<u8> = self.channels.iter().copied().collect();
        if unique.len() != self.channels.len() {
            return Err(P2pError::InvalidNodeInfo("duplicate channel id".into()));
        }
        if self.moniker.len() > MAX_MONIKER_LEN || self.moniker.chars().any(char::is_control) {
            return Err(P2pError::InvalidNodeInfo("bad moniker".into()));
        }
        if !self.listen_addr.is_empty() && self.listen_socket_addr().is_none() {
            return Err(P2pError::InvalidNodeInfo(format!(
                "bad listen address {:?}",
                self.listen_addr
            )));
        }
        Ok(())
    }

    /// Network and major version must match, and the two nodes must share
    /// at least one channel when both declare any.
    pub fn compatible_with(&self, other: &NodeInfo) -> P2pResult<()> {
        if self.network != other.network {
            return Err(P2pError::Incompatible(format!(
                "network {} vs {}",
                other.network, self.network
            )));
        }
        if major_version(&self.version) != major_version(&other.version) {
            return Err(P2pError::Incompatible(format!(
                "version {} vs {}",
                other.version, self.version
            )));
        }
        if self.channels.is_empty() || other.channels.is_empty() {
            return Ok(());
        }
        if !self.channels.iter().any(|c| other.channels.contains(c)) {
            return Err(P2pError::Incompatible("no common channels".into()));
        }
        Ok(())
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({}, {}, v{})",
            self.id().short(),
            self.listen_addr,
            self.moniker,
            self.role,
            self.version
        )
    }
}
