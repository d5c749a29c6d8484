//! # Protocol Configuration & Constants
//!
//! Every magic number of the overlay and the mempool lives here. Runtime
//! knobs that an operator may want to tune are mirrored into the `*Config`
//! structs of the individual modules, which take their defaults from the
//! values below.
//!
//! Changing a wire-level constant (packet sizes, channel ids, header widths)
//! splits the network. Changing a timer only changes how politely we behave.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Identity
// ---------------------------------------------------------------------------

/// Default network identifier exchanged during the TCP handshake. Peers on a
/// different network are rejected before any reactor sees them.
pub const DEFAULT_NETWORK: &str = "linkmesh-devnet";

/// Wire protocol version carried in `NodeInfo`. Peers must agree on the major
/// component (everything before the first `.`).
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// UDP discovery protocol version carried in every `ping`.
pub const DISCOVERY_PING_VERSION: u32 = 4;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Length of a node id (keccak256 of the public key).
pub const NODE_ID_LENGTH: usize = 32;

/// Ed25519 public key length.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

// ---------------------------------------------------------------------------
// UDP Discovery Wire Format
// ---------------------------------------------------------------------------

/// Width of the packet hash (keccak256 over everything after it).
pub const UDP_MAC_SIZE: usize = 32;

/// Width of the signature slot. Signatures are length-prefixed and
/// zero-padded to fill it.
pub const UDP_SIG_SIZE: usize = 73;

/// Width of the encoded public key slot.
pub const UDP_PUBKEY_SIZE: usize = 40;

/// Total header width in front of the packet type byte.
pub const UDP_HEAD_SIZE: usize = UDP_MAC_SIZE + UDP_SIG_SIZE + UDP_PUBKEY_SIZE;

/// Hard upper bound on a discovery datagram.
pub const UDP_MAX_PACKET_SIZE: usize = 1280;

/// Default time to wait for a reply to a discovery RPC.
pub const UDP_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Relative expiration stamped on every outgoing discovery packet.
pub const UDP_PACKET_EXPIRATION: Duration = Duration::from_secs(20);

/// A ping/pong exchange younger than this counts as a valid endpoint proof.
pub const BOND_EXPIRATION: Duration = Duration::from_secs(12 * 60 * 60);

/// Consecutive matcher timeouts that trigger a clock drift warning.
pub const NTP_FAILURE_THRESHOLD: u32 = 32;

// ---------------------------------------------------------------------------
// Kademlia Table
// ---------------------------------------------------------------------------

/// Lookup concurrency.
pub const ALPHA: usize = 3;

/// Live entries per bucket, also the `k` of a lookup.
pub const BUCKET_SIZE: usize = 16;

/// Replacement entries per bucket.
pub const MAX_REPLACEMENTS: usize = 10;

/// Number of buckets. Distances at or below `BUCKET_MIN_DISTANCE` share
/// bucket 0.
pub const N_BUCKETS: usize = 17;

/// Log distance floor: `256 - N_BUCKETS`.
pub const BUCKET_MIN_DISTANCE: usize = 256 - N_BUCKETS;

/// Same-/24 addresses allowed per bucket.
pub const BUCKET_IP_LIMIT: usize = 2;

/// Same-/24 addresses allowed across the whole table.
pub const TABLE_IP_LIMIT: usize = 10;

/// Prefix length used for the IP limits above.
pub const TABLE_SUBNET: u8 = 24;

/// Consecutive failed findnode calls before a node is dropped.
pub const MAX_FINDNODE_FAILURES: u32 = 5;

/// Full table refresh interval.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Upper bound of the randomized revalidation interval.
pub const REVALIDATE_INTERVAL: Duration = Duration::from_secs(10);

/// How often live entries are copied into the node database.
pub const COPY_NODES_INTERVAL: Duration = Duration::from_secs(45 * 60);

/// Minimum time in the table before an entry is considered a seed.
pub const SEED_MIN_TABLE_TIME: Duration = Duration::from_secs(5 * 60);

/// Number of seeds pulled from the database on refresh.
pub const SEED_COUNT: usize = 30;

/// Database entries older than this are not used as seeds.
pub const SEED_MAX_AGE: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Default outbound target when the bootnode list is empty.
pub const DEFAULT_SEEDS: usize = 3;

// ---------------------------------------------------------------------------
// Peer Database
// ---------------------------------------------------------------------------

/// Entries whose last pong is older than this are expired.
pub const DB_NODE_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the expirer runs.
pub const DB_CLEANUP_CYCLE: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Switch & Connections
// ---------------------------------------------------------------------------

/// Default TCP listen port.
pub const DEFAULT_P2P_PORT: u16 = 13500;

/// Default status API port.
pub const DEFAULT_API_PORT: u16 = 13501;

/// Cap on total peer-set size.
pub const MAX_NUM_PEERS: usize = 50;

/// Outbound dial target for general peers.
pub const MAX_OUTBOUND: usize = 10;

/// Handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// TCP dial deadline.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Random spread applied before each dial of a batch.
pub const DIAL_RANDOMIZER: Duration = Duration::from_millis(3000);

/// Window of the inbound IP history.
pub const INBOUND_THROTTLE_TIME: Duration = Duration::from_secs(30);

/// Concurrent inbound connections allowed from one public IP.
pub const MAX_INBOUND_PER_IP: usize = 10;

/// How long a misbehaving node id stays blacklisted.
pub const BLACKLIST_TIMEOUT: Duration = Duration::from_secs(600);

/// Outbound dial controller period.
pub const DIAL_OUT_INTERVAL: Duration = Duration::from_secs(20);

/// Minimum spacing between network refreshes of a seed table.
pub const HTTP_LOOKUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long to wait for the outbound count to grow after a role change.
pub const WAIT_NEW_SEEDS_TIMEOUT: Duration = Duration::from_secs(60);

/// Bootnode fetch attempts during a role change.
pub const GET_SEEDS_RETRIES: usize = 30;

// ---------------------------------------------------------------------------
// Multiplexed Connection
// ---------------------------------------------------------------------------

/// Channel used for keepalive frames. Reactors may not claim it.
pub const PING_CHANNEL: u8 = 0x00;

/// Default per-connection send rate in bytes per second.
pub const DEFAULT_SEND_RATE: u64 = 5_120_000;

/// Default per-connection receive rate in bytes per second.
pub const DEFAULT_RECV_RATE: u64 = 5_120_000;

/// Default maximum payload of a single frame.
pub const DEFAULT_MAX_PACKET_PAYLOAD: usize = 1024;

/// Interval at which buffered frames are flushed to the socket.
pub const FLUSH_THROTTLE: Duration = Duration::from_millis(73);

/// Keepalive period.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Pong deadline after a ping.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(45);

/// Default blocking `send` deadline on a channel queue.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-channel send queue capacity.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1;

/// Default per-channel receive buffer limit for reassembly.
pub const DEFAULT_RECV_MESSAGE_CAPACITY: usize = 22_020_096; // 21 MiB

/// Upper bound on an encoded `NodeInfo`.
pub const MAX_NODE_INFO_SIZE: usize = 10_240;

// ---------------------------------------------------------------------------
// Mempool
// ---------------------------------------------------------------------------

/// Reactor channel id.
pub const MEMPOOL_CHANNEL: u8 = 0x30;

/// Future-queue eviction period.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(10);

/// Stats log period.
pub const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Shards of the seen-hash cache.
pub const SEEN_CACHE_SHARDS: usize = 4;

/// Delay before a committed hash leaves the seen-hash cache, in seconds.
pub const SEEN_CACHE_DELAY_SECS: u64 = 30;

/// Delay before a requested hash leaves the reactor hash cache, in seconds.
pub const REQUEST_CACHE_DELAY_SECS: u64 = 15;

/// Upper bound of a receive queue in the mempool reactor.
pub const RECEIVE_CACHE_MAX_LENGTH: usize = 10_000;

/// Capacity of the reactor's transaction request queue.
pub const TX_REQUEST_QUEUE_SIZE: usize = 20_000;

/// Mempool channel priority.
pub const MEMPOOL_CHANNEL_PRIORITY: u32 = 5;

/// Mempool channel send queue capacity.
pub const MEMPOOL_SEND_QUEUE_CAPACITY: usize = 2000;

/// Base batch size of a hash announcement; a random 0..256 is added.
pub const HASH_BATCH_BASE: usize = 256;

/// Back-off when a peer-side broadcast walk fails.
pub const PEER_CATCHUP_SLEEP: Duration = Duration::from_millis(100);

/// Back-off before re-queueing a received tx the pool rejected as full.
pub const MEMPOOL_FULL_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Sync Height
// ---------------------------------------------------------------------------

/// Consecutive stagnant observations before the bootnode is consulted.
pub const MAX_SAME_HEIGHT_COUNT: u32 = 2;

/// Minimum spacing between height checks.
pub const MIN_HEIGHT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// How far the chain must be ahead of us before we re-bootstrap.
pub const HEIGHT_LAG_THRESHOLD: u64 = 2;

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

/// Returns the major component of a version string.
///
/// `"1.4.2"` yields `"1"`; a string without dots is returned unchanged.
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_header_layout() {
        assert_eq!(UDP_HEAD_SIZE, 145);
        assert!(UDP_HEAD_SIZE + 1 < UDP_MAX_PACKET_SIZE);
    }

    #[test]
    fn test_bucket_floor() {
        assert_eq!(BUCKET_MIN_DISTANCE, 239);
        assert!(TABLE_IP_LIMIT >= BUCKET_IP_LIMIT);
    }

    #[test]
    fn test_keepalive_ordering() {
        assert!(PONG_TIMEOUT < PING_INTERVAL);
        assert!(FLUSH_THROTTLE < PONG_TIMEOUT);
    }

    #[test]
    fn test_reserved_channels_distinct() {
        assert_ne!(PING_CHANNEL, MEMPOOL_CHANNEL);
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("1.4.2"), "1");
        assert_eq!(major_version("7"), "7");
        assert_eq!(major_version(PROTOCOL_VERSION), "1");
    }
}
