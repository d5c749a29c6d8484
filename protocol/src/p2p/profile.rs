//! # Node Profile
//!
//! The two pieces of process-wide mutable state the overlay needs: which
//! role the bootnode last assigned to us, and the list of bootnode URLs to
//! ask. Components receive an `Arc<NodeProfile>` instead of reaching for
//! globals, so tests can run several nodes with different roles in one
//! process.

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

// ---------------------------------------------------------------------------
// NodeRole
// ---------------------------------------------------------------------------

/// A node's advertised class.
///
/// Privileged nodes (validators) discover each other through the bootnode
/// seed list; everyone else runs the Kademlia table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i32", try_from = "i32")]
pub enum NodeRole {
    Validator,
    #[default]
    Peer,
}

impl NodeRole {
    /// Numeric code used by the bootnode API.
    pub const VALIDATOR_CODE: i32 = 5;
    pub const PEER_CODE: i32 = 6;

    pub fn code(self) -> i32 {
        match self {
            NodeRole::Validator => Self::VALIDATOR_CODE,
            NodeRole::Peer => Self::PEER_CODE,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            Self::VALIDATOR_CODE => Some(NodeRole::Validator),
            Self::PEER_CODE => Some(NodeRole::Peer),
            _ => None,
        }
    }

    /// Whether this role uses the seed-list table instead of the DHT.
    pub fn is_privileged(self) -> bool {
        matches!(self, NodeRole::Validator)
    }
}

impl From<NodeRole> for i32 {
    fn from(role: NodeRole) -> i32 {
        role.code()
    }
}

impl TryFrom<i32> for NodeRole {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        NodeRole::from_code(code).ok_or_else(|| format!("unknown node role code {code}"))
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Validator => f.write_str("validator"),
            NodeRole::Peer => f.write_str("peer"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeProfile
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Bootnodes {
    addrs: Vec<String>,
    next: usize,
}

/// Shared role and bootnode rotation.
#[derive(Debug)]
pub struct NodeProfile {
    role: RwLock<NodeRole>,
    bootnodes: RwLock<Bootnodes>,
}

impl NodeProfile {
    pub fn new(role: NodeRole, bootnodes: Vec<String>) -> Self {
        let next = if bootnodes.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..bootnodes.len())
        };
        Self {
            role: RwLock::new(role),
            bootnodes: RwLock::new(Bootnodes {
                addrs: bootnodes,
                next,
            }),
        }
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read()
    }

    pub fn set_role(&self, role: NodeRole) {
        *self.role.write() = role;
    }

    /// Replaces the bootnode list from a comma separated string.
    ///
    /// Bare `ip:port` entries are taken to be HTTPS endpoints. An empty input
    /// leaves the current list in place.
    pub fn update_bootnodes(&self, list: &str) {
        let addrs = parse_bootnode_list(list);
        if addrs.is_empty() {
            return;
        }
        let next = rand::thread_rng().gen_range(0..addrs.len());
        let count = addrs.len();
        *self.bootnodes.write() = Bootnodes { addrs, next };
        info!(count, "bootnode list updated");
    }

    pub fn bootnode_count(&self) -> usize {
        self.bootnodes.read().addrs.len()
    }

    pub fn bootnodes(&self) -> Vec<String> {
        self.bootnodes.read().addrs.clone()
    }

    /// The next bootnode in round-robin order, or `None` if none are
    /// configured.
    pub fn next_bootnode(&self) -> Option<String> {
        let mut b = self.bootnodes.write();
        if b.addrs.is_empty() {
            return None;
        }
        let idx = b.next % b.addrs.len();
        b.next = idx + 1;
        Some(b.addrs[idx].clone())
    }
}

/// Splits a comma separated bootnode list, prefixing bare `ip:port` entries
/// with `https://`.
pub fn parse_bootnode_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            if entry.split(':').count() == 2 && !entry.contains("://") {
                format!("https://{entry}")
            } else {
                entry.to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_codes_roundtrip() {
        for role in [NodeRole::Validator, NodeRole::Peer] {
            assert_eq!(NodeRole::from_code(role.code()), Some(role));
        }
        assert_eq!(NodeRole::from_code(42), None);
        assert!(NodeRole::Validator.is_privileged());
        assert!(!NodeRole::Peer.is_privileged());
    }

    #[test]
    fn role_serializes_as_code() {
        assert_eq!(serde_json::to_string(&NodeRole::Validator).unwrap(), "5");
        let back: NodeRole = serde_json::from_str("6").unwrap();
        assert_eq!(back, NodeRole::Peer);
    }

    #[test]
    fn bootnode_list_parsing() {
        let parsed = parse_bootnode_list("1.2.3.4:443, https://boot.example:8443,http://x:1");
        assert_eq!(
            parsed,
            vec![
                "https://1.2.3.4:443".to_string(),
                "https://boot.example:8443".to_string(),
                "http://x:1".to_string(),
            ]
        );
        assert!(parse_bootnode_list("").is_empty());
    }

    #[test]
    fn round_robin_visits_every_bootnode() {
        let profile = NodeProfile::new(
            NodeRole::Peer,
            vec!["a".into(), "b".into(), "c".into()],
        );
        let mut seen: Vec<String> = (0..3).filter_map(|_| profile.next_bootnode()).collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_profile_has_no_bootnode() {
        let profile = NodeProfile::new(NodeRole::Peer, Vec::new());
        assert_eq!(profile.next_bootnode(), None);
        profile.update_bootnodes("");
        assert_eq!(profile.bootnode_count(), 0);
        profile.update_bootnodes("9.9.9.9:1");
        assert_eq!(profile.next_bootnode().as_deref(), Some("https://9.9.9.9:1"));
    }

    #[test]
    fn role_can_change() {
        let profile = NodeProfile::new(NodeRole::Peer, Vec::new());
        profile.set_role(NodeRole::Validator);
        assert_eq!(profile.role(), NodeRole::Validator);
    }
}
