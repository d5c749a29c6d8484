//! # Peer Database
//!
//! Persistent memory of discovered nodes, kept in a sled tree so that a
//! restarted node can seed its routing table without asking anyone.
//!
//! ## Key Layout
//!
//! | Key                               | Value                       |
//! |-----------------------------------|-----------------------------|
//! | `n:<id32>:v4`                     | `bincode(Node)`             |
//! | `n:<id32>:v4:<ip16>:findfail`     | varint findnode failures    |
//! | `n:<id32>:v4:<ip16>:lastping`     | varint unix seconds         |
//! | `n:<id32>:v4:<ip16>:lastpong`     | varint unix seconds         |
//!
//! IPs are always stored in their 16-byte form so v4 and v4-mapped v6
//! addresses share a slot. Integers use zig-zag varints.
//!
//! A background expirer drops any per-IP record whose last pong is older
//! than 24 hours, and the node record itself when no IP has ponged
//! recently.

use rand::RngCore;
use sled::{Db, Tree};
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{DB_CLEANUP_CYCLE, DB_NODE_EXPIRATION, NODE_ID_LENGTH};
use crate::p2p::node::{Node, NodeId};

const NODE_PREFIX: &[u8] = b"n:";
const DISCOVER_ROOT: &[u8] = b"v4";
const FIELD_FIND_FAILS: &str = "findfail";
const FIELD_PING: &str = "lastping";
const FIELD_PONG: &str = "lastpong";

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn node_key(id: &NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(NODE_PREFIX.len() + NODE_ID_LENGTH + 1 + DISCOVER_ROOT.len());
    key.extend_from_slice(NODE_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key.push(b':');
    key.extend_from_slice(DISCOVER_ROOT);
    key
}

fn ip16(ip: &IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn item_key(id: &NodeId, ip: &IpAddr, field: &str) -> Vec<u8> {
    let mut key = node_key(id);
    key.push(b':');
    key.extend_from_slice(&ip16(ip));
    key.push(b':');
    key.extend_from_slice(field.as_bytes());
    key
}

/// Splits a key into `(id, rest)` where `rest` follows `n:<id>:`.
fn split_node_key(key: &[u8]) -> Option<(NodeId, &[u8])> {
    let item = key.strip_prefix(NODE_PREFIX)?;
    if item.len() < NODE_ID_LENGTH + 1 {
        return None;
    }
    let mut id = NodeId::zero();
    id.as_mut_bytes().copy_from_slice(&item[..NODE_ID_LENGTH]);
    Some((id, &item[NODE_ID_LENGTH + 1..]))
}

/// Splits a per-IP item key into `(id, ip, field)`.
fn split_item_key(key: &[u8]) -> Option<(NodeId, IpAddr, &[u8])> {
    let (id, rest) = split_node_key(key)?;
    let rest = rest.strip_prefix(DISCOVER_ROOT)?.strip_prefix(b":")?;
    if rest.len() < 17 {
        return None;
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&rest[..16]);
    let v6 = Ipv6Addr::from(octets);
    let ip = match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    };
    Some((id, ip, &rest[17..]))
}

fn put_varint(n: i64) -> Vec<u8> {
    let mut ux = ((n << 1) ^ (n >> 63)) as u64;
    let mut out = Vec::with_capacity(10);
    while ux >= 0x80 {
        out.push((ux as u8) | 0x80);
        ux >>= 7;
    }
    out.push(ux as u8);
    out
}

fn read_varint(buf: &[u8]) -> Option<i64> {
    let mut ux = 0u64;
    let mut shift = 0u32;
    for (i, b) in buf.iter().enumerate() {
        if i == 10 {
            return None;
        }
        ux |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            let x = (ux >> 1) as i64;
            return Some(if ux & 1 != 0 { !x } else { x });
        }
        shift += 7;
    }
    None
}

fn unix_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn from_unix(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

// ---------------------------------------------------------------------------
// PeerDb
// ---------------------------------------------------------------------------

/// Node records plus per-IP liveness timestamps.
#[derive(Debug, Clone)]
pub struct PeerDb {
    db: Db,
    nodes: Tree,
}

impl PeerDb {
    /// Open or create a peer database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database, removed on drop.
    pub fn open_temporary() -> DbResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let nodes = db.open_tree("discover")?;
        Ok(Self { db, nodes })
    }

    // -- Node records -------------------------------------------------------

    pub fn update_node(&self, node: &Node) -> DbResult<()> {
        let blob = bincode::serialize(node).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.nodes.insert(node_key(&node.id), blob)?;
        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> DbResult<Option<Node>> {
        match self.nodes.get(node_key(id))? {
            Some(blob) => {
                let mut node: Node = bincode::deserialize(&blob)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                node.id = *id;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Deletes the node record and every per-IP field under it.
    pub fn delete_node(&self, id: &NodeId) -> DbResult<()> {
        self.delete_prefix(&node_key(id))
    }

    // -- Liveness fields ----------------------------------------------------

    fn fetch_i64(&self, key: &[u8]) -> i64 {
        match self.nodes.get(key) {
            Ok(Some(blob)) => read_varint(&blob).unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "peer db read failed");
                0
            }
        }
    }

    fn store_i64(&self, key: Vec<u8>, n: i64) -> DbResult<()> {
        self.nodes.insert(key, put_varint(n))?;
        Ok(())
    }

    pub fn last_ping_received(&self, id: &NodeId, ip: &IpAddr) -> SystemTime {
        from_unix(self.fetch_i64(&item_key(id, ip, FIELD_PING)))
    }

    pub fn update_last_ping_received(&self, id: &NodeId, ip: &IpAddr, at: SystemTime) -> DbResult<()> {
        self.store_i64(item_key(id, ip, FIELD_PING), unix_secs(at))
    }

    pub fn last_pong_received(&self, id: &NodeId, ip: &IpAddr) -> SystemTime {
        from_unix(self.fetch_i64(&item_key(id, ip, FIELD_PONG)))
    }

    pub fn update_last_pong_received(&self, id: &NodeId, ip: &IpAddr, at: SystemTime) -> DbResult<()> {
        self.store_i64(item_key(id, ip, FIELD_PONG), unix_secs(at))
    }

    pub fn find_fails(&self, id: &NodeId, ip: &IpAddr) -> u32 {
        self.fetch_i64(&item_key(id, ip, FIELD_FIND_FAILS)).max(0) as u32
    }

    pub fn update_find_fails(&self, id: &NodeId, ip: &IpAddr, fails: u32) -> DbResult<()> {
        self.store_i64(item_key(id, ip, FIELD_FIND_FAILS), i64::from(fails))
    }

    // -- Seeds --------------------------------------------------------------

    /// Up to `n` distinct nodes that ponged within `max_age`.
    ///
    /// Each attempt seeks to a random id and takes the first acceptable
    /// record at or after it. The first id byte advances by a small random
    /// step every time so tiny databases still get fully covered. At most
    /// `5 * n` seeks are made.
    pub fn query_seeds(&self, n: usize, max_age: Duration) -> Vec<Node> {
        let now = SystemTime::now();
        let mut rng = rand::thread_rng();
        let mut nodes: Vec<Node> = Vec::with_capacity(n);
        let mut id = NodeId::random();

        let mut seeks = 0;
        while nodes.len() < n && seeks < n * 5 {
            seeks += 1;
            let ctr = id.as_bytes()[0];
            rng.fill_bytes(id.as_mut_bytes());
            let step = id.as_bytes()[0] % 16;
            id.as_mut_bytes()[0] = ctr.wrapping_add(step);

            if let Some(node) = self.first_seed_from(&node_key(&id), &nodes, now, max_age) {
                nodes.push(node);
            }
        }
        nodes
    }

    fn first_seed_from(
        &self,
        start: &[u8],
        taken: &[Node],
        now: SystemTime,
        max_age: Duration,
    ) -> Option<Node> {
        for entry in self.nodes.range(start.to_vec()..) {
            let Ok((key, value)) = entry else { continue };
            let Some((id, rest)) = split_node_key(&key) else { continue };
            if rest != DISCOVER_ROOT {
                continue;
            }
            let Ok(mut node) = bincode::deserialize::<Node>(&value) else {
                continue;
            };
            node.id = id;
            let age = now
                .duration_since(self.last_pong_received(&node.id, &node.ip()))
                .unwrap_or_default();
            if age > max_age {
                continue;
            }
            if taken.iter().any(|t| t.id == node.id) {
                continue;
            }
            return Some(node);
        }
        None
    }

    // -- Expiry -------------------------------------------------------------

    fn delete_prefix(&self, prefix: &[u8]) -> DbResult<()> {
        let keys: Vec<_> = self
            .nodes
            .scan_prefix(prefix)
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.nodes.remove(key)?;
        }
        Ok(())
    }

    /// Drops data for nodes not seen since `now - DB_NODE_EXPIRATION`.
    ///
    /// Returns the number of whole node records removed.
    pub fn expire_nodes(&self, now: SystemTime) -> DbResult<usize> {
        let threshold = unix_secs(now) - DB_NODE_EXPIRATION.as_secs() as i64;

        let mut stale_items: Vec<(NodeId, IpAddr)> = Vec::new();
        let mut youngest: Vec<(NodeId, i64)> = Vec::new();

        for entry in self.nodes.scan_prefix(NODE_PREFIX) {
            let (key, value) = entry?;
            let Some((id, ip, field)) = split_item_key(&key) else { continue };
            if field != FIELD_PONG.as_bytes() {
                continue;
            }
            let pong = read_varint(&value).unwrap_or(0);
            if pong < threshold {
                stale_items.push((id, ip));
            }
            match youngest.last_mut() {
                Some((last, t)) if *last == id => *t = (*t).max(pong),
                _ => youngest.push((id, pong)),
            }
        }

        for (id, ip) in &stale_items {
            debug!(id = %id.short(), %ip, "expiring stale ip record");
            self.delete_prefix(&item_key(id, ip, ""))?;
        }

        let mut removed = 0;
        for (id, pong) in youngest {
            if pong > 0 && pong < threshold {
                info!(id = %id.short(), "expiring node");
                self.delete_prefix(&node_key(&id))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Runs [`expire_nodes`](Self::expire_nodes) every cleanup cycle until
    /// `shutdown` flips to `true`.
    pub fn spawn_expirer(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let db = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DB_CLEANUP_CYCLE);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = db.expire_nodes(SystemTime::now()) {
                            warn!(error = %e, "peer db expiry failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.nodes
            .scan_prefix(NODE_PREFIX)
            .keys()
            .filter_map(Result::ok)
            .filter(|k| matches!(split_node_key(k), Some((_, rest)) if rest == DISCOVER_ROOT))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::node::Endpoint;
    use std::net::Ipv4Addr;

    // -- Helpers ------------------------------------------------------------

    fn node_at(last_octet: u8) -> Node {
        Node::new(
            NodeId::random(),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 30301, 30302),
        )
    }

    // -- Tests --------------------------------------------------------------

    #[test]
    fn varint_roundtrip() {
        for n in [0i64, 1, -1, 63, -64, 300, 1_700_000_000, i64::MAX, i64::MIN] {
            assert_eq!(read_varint(&put_varint(n)), Some(n), "value {n}");
        }
        assert_eq!(read_varint(&[]), None);
        assert_eq!(put_varint(1), vec![2]);
        assert_eq!(put_varint(-1), vec![1]);
    }

    #[test]
    fn item_key_splits_back() {
        let id = NodeId::random();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let key = item_key(&id, &ip, FIELD_PONG);
        let (sid, sip, field) = split_item_key(&key).unwrap();
        assert_eq!(sid, id);
        assert_eq!(sip, ip);
        assert_eq!(field, FIELD_PONG.as_bytes());
        assert!(split_item_key(&node_key(&id)).is_none());
    }

    #[test]
    fn node_record_roundtrip() {
        let db = PeerDb::open_temporary().unwrap();
        let node = node_at(1);
        db.update_node(&node).unwrap();
        assert_eq!(db.node(&node.id).unwrap(), Some(node.clone()));
        assert_eq!(db.len(), 1);

        db.delete_node(&node.id).unwrap();
        assert_eq!(db.node(&node.id).unwrap(), None);
        assert!(db.is_empty());
    }

    #[test]
    fn liveness_fields_default_to_epoch() {
        let db = PeerDb::open_temporary().unwrap();
        let node = node_at(2);
        assert_eq!(db.last_pong_received(&node.id, &node.ip()), UNIX_EPOCH);
        assert_eq!(db.find_fails(&node.id, &node.ip()), 0);

        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        db.update_last_pong_received(&node.id, &node.ip(), at).unwrap();
        db.update_last_ping_received(&node.id, &node.ip(), at).unwrap();
        db.update_find_fails(&node.id, &node.ip(), 3).unwrap();
        assert_eq!(db.last_pong_received(&node.id, &node.ip()), at);
        assert_eq!(db.last_ping_received(&node.id, &node.ip()), at);
        assert_eq!(db.find_fails(&node.id, &node.ip()), 3);
    }

    #[test]
    fn query_seeds_skips_stale_nodes() {
        let db = PeerDb::open_temporary().unwrap();
        let now = SystemTime::now();
        let fresh: Vec<Node> = (1..=4).map(node_at).collect();
        for n in &fresh {
            db.update_node(n).unwrap();
            db.update_last_pong_received(&n.id, &n.ip(), now).unwrap();
        }
        let stale = node_at(9);
        db.update_node(&stale).unwrap();
        db.update_last_pong_received(&stale.id, &stale.ip(), now - Duration::from_secs(3600))
            .unwrap();

        let seeds = db.query_seeds(10, Duration::from_secs(60));
        assert!(!seeds.is_empty());
        assert!(seeds.len() <= 4);
        assert!(seeds.iter().all(|s| s.id != stale.id));
        let mut ids: Vec<_> = seeds.iter().map(|s| s.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), seeds.len());
    }

    #[test]
    fn expire_drops_old_nodes_only() {
        let db = PeerDb::open_temporary().unwrap();
        let now = SystemTime::now();

        let old = node_at(1);
        db.update_node(&old).unwrap();
        db.update_last_pong_received(&old.id, &old.ip(), now - Duration::from_secs(2 * 86_400))
            .unwrap();

        let young = node_at(2);
        db.update_node(&young).unwrap();
        db.update_last_pong_received(&young.id, &young.ip(), now).unwrap();

        assert_eq!(db.expire_nodes(now).unwrap(), 1);
        assert!(db.node(&old.id).unwrap().is_none());
        assert!(db.node(&young.id).unwrap().is_some());
        assert_eq!(db.last_pong_received(&old.id, &old.ip()), UNIX_EPOCH);
    }

    #[test]
    fn persistent_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let node = node_at(3);
        {
            let db = PeerDb::open(dir.path()).unwrap();
            db.update_node(&node).unwrap();
            db.flush().unwrap();
        }
        let db = PeerDb::open(dir.path()).unwrap();
        assert!(db.node(&node.id).unwrap().is_some());
    }
}
