//! # Peer Discovery
//!
//! Two ways of finding peers to dial, behind one trait:
//!
//! - [`DhtTable`]: a Kademlia routing table kept fresh over the UDP RPC in
//!   [`udp`]. Used by ordinary peers.
//! - [`HttpTable`]: the seed list handed out by the bootnode service. Used
//!   by privileged nodes, whose set is small and changes rarely.
//!
//! The connection manager only talks to [`DiscoverTable`] and can swap one
//! table for the other when the node's role changes.

pub mod db;
pub mod http_table;
pub mod packet;
pub mod table;
pub mod udp;

use async_trait::async_trait;
use std::collections::HashSet;

use super::bootnode::BootnodeError;
use super::node::{Node, NodeId};

pub use db::{DbError, PeerDb};
pub use http_table::HttpTable;
pub use table::DhtTable;
pub use udp::{Udp, UdpError};

#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("invalid table config: {0}")]
    Config(String),

    #[error(transparent)]
    Udp(#[from] UdpError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Bootnode(#[from] BootnodeError),
}

/// Source of dial candidates.
#[async_trait]
pub trait DiscoverTable: Send + Sync {
    /// Starts background maintenance, if any.
    async fn start(&self) -> Result<(), DiscoverError>;

    /// Stops background maintenance and aborts outstanding lookups.
    async fn stop(&self);

    /// Discovers fresh nodes from the network (or the bootnode).
    async fn lookup_random(&self) -> Vec<Node>;

    /// Up to `max` cached nodes in random order, skipping `exclude`.
    fn read_random_nodes(&self, max: usize, exclude: &HashSet<NodeId>) -> Vec<Node>;

    /// Target number of outbound connections.
    fn max_dial_out_num(&self) -> usize;

    /// How many cached nodes to pull per dial round.
    fn max_con_num_from_cache(&self) -> usize;

    fn is_dht_table(&self) -> bool;
}

/// Drops `local` and invalid entries, returning the kept nodes and the
/// number of distinct ids among them.
pub(crate) fn split_seeds(nodes: Vec<Node>, local: &NodeId, require_complete: bool) -> (Vec<Node>, usize) {
    let mut ids = HashSet::new();
    let kept: Vec<Node> = nodes
        .into_iter()
        .filter(|n| n.id != *local)
        .filter(|n| !require_complete || n.validate_complete().is_ok())
        .inspect(|n| {
            ids.insert(n.id);
        })
        .collect();
    (kept, ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::node::Endpoint;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn split_seeds_counts_distinct_ids() {
        let local = NodeId::random();
        let other = NodeId::random();
        let ep = |o: u8| Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, o)), 1, 2);
        let nodes = vec![
            Node::new(local, ep(1)),
            Node::new(other, ep(2)),
            Node::new(other, ep(3)),
            Node::new(NodeId::random(), Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1, 2)),
        ];
        let (kept, distinct) = split_seeds(nodes.clone(), &local, true);
        assert_eq!(kept.len(), 2);
        assert_eq!(distinct, 1);

        let (kept, distinct) = split_seeds(nodes, &local, false);
        assert_eq!(kept.len(), 3);
        assert_eq!(distinct, 2);
    }
}
