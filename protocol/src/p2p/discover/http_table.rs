//! Seed-list table for privileged nodes.
//!
//! No sockets and no buckets: the bootnode hands out the full validator set
//! and this table caches it. Lookups re-fetch the list; dial rounds read a
//! random permutation of the cache.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{split_seeds, DiscoverError, DiscoverTable};
use crate::config::DEFAULT_SEEDS;
use crate::p2p::bootnode::SeedSource;
use crate::p2p::node::{Node, NodeId};

struct SeedCache {
    seeds: Vec<Node>,
    distinct: usize,
    rng: StdRng,
}

pub struct HttpTable {
    local: NodeId,
    source: Arc<dyn SeedSource>,
    cache: Mutex<SeedCache>,
}

impl HttpTable {
    pub fn new(local: NodeId, source: Arc<dyn SeedSource>, fallback: Vec<Node>) -> Self {
        let (seeds, distinct) = split_seeds(fallback, &local, false);
        info!(seeds = distinct, "http table created");
        Self {
            local,
            source,
            cache: Mutex::new(SeedCache {
                seeds,
                distinct,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Cached seeds in bootnode order.
    pub fn seeds(&self) -> Vec<Node> {
        self.cache.lock().seeds.clone()
    }
}

#[async_trait]
impl DiscoverTable for HttpTable {
    async fn start(&self) -> Result<(), DiscoverError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn lookup_random(&self) -> Vec<Node> {
        let nodes = match self.source.get_seeds().await {
            Ok((nodes, _role)) => nodes,
            Err(e) => {
                warn!(error = %e, "seed lookup failed");
                return Vec::new();
            }
        };
        let (kept, distinct) = split_seeds(nodes, &self.local, false);
        if !kept.is_empty() {
            let mut cache = self.cache.lock();
            cache.seeds = kept.clone();
            cache.distinct = distinct;
            debug!(seeds = distinct, "seed cache updated");
        }
        kept
    }

    fn read_random_nodes(&self, max: usize, exclude: &HashSet<NodeId>) -> Vec<Node> {
        let mut cache = self.cache.lock();
        let mut out: Vec<Node> = cache
            .seeds
            .iter()
            .filter(|n| !exclude.contains(&n.id))
            .cloned()
            .collect();
        out.shuffle(&mut cache.rng);
        out.truncate(max);
        out
    }

    fn max_dial_out_num(&self) -> usize {
        let distinct = self.cache.lock().distinct;
        if distinct > 0 {
            distinct
        } else {
            DEFAULT_SEEDS
        }
    }

    fn max_con_num_from_cache(&self) -> usize {
        self.cache.lock().seeds.len()
    }

    fn is_dht_table(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::bootnode::BootnodeError;
    use crate::p2p::node::Endpoint;
    use crate::p2p::profile::NodeRole;
    use std::net::{IpAddr, Ipv4Addr};

    struct FixedSeeds(Vec<Node>);

    #[async_trait]
    impl SeedSource for FixedSeeds {
        async fn get_seeds(&self) -> Result<(Vec<Node>, NodeRole), BootnodeError> {
            if self.0.is_empty() {
                return Err(BootnodeError::NoBootnode);
            }
            Ok((self.0.clone(), NodeRole::Validator))
        }

        async fn current_height(&self) -> Result<u64, BootnodeError> {
            Ok(0)
        }
    }

    fn node(id: NodeId, last: u8) -> Node {
        Node::new(id, Endpoint::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, last)), 1, 2))
    }

    #[tokio::test]
    async fn lookup_skips_self_and_counts_distinct() {
        let local = NodeId::random();
        let shared = NodeId::random();
        let seeds = vec![node(local, 1), node(shared, 2), node(shared, 3), node(NodeId::random(), 4)];
        let table = HttpTable::new(local, Arc::new(FixedSeeds(seeds)), Vec::new());
        assert_eq!(table.max_dial_out_num(), DEFAULT_SEEDS);

        let found = table.lookup_random().await;
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|n| n.id != local));
        assert_eq!(table.max_dial_out_num(), 2);
        assert_eq!(table.max_con_num_from_cache(), 3);
        assert!(!table.is_dht_table());
    }

    #[tokio::test]
    async fn failed_lookup_keeps_cache() {
        let local = NodeId::random();
        let fallback = vec![node(NodeId::random(), 1)];
        let table = HttpTable::new(local, Arc::new(FixedSeeds(Vec::new())), fallback.clone());
        assert!(table.lookup_random().await.is_empty());
        assert_eq!(table.seeds(), fallback);
    }

    #[test]
    fn read_random_excludes_connected() {
        let local = NodeId::random();
        let seeds: Vec<Node> = (1..=5).map(|i| node(NodeId::random(), i)).collect();
        let table = HttpTable::new(local, Arc::new(FixedSeeds(Vec::new())), seeds.clone());
        let exclude: HashSet<NodeId> = seeds[..2].iter().map(|n| n.id).collect();

        let got = table.read_random_nodes(10, &exclude);
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|n| !exclude.contains(&n.id)));
        assert_eq!(table.read_random_nodes(2, &HashSet::new()).len(), 2);
    }
}
