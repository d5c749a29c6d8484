//! # Peer-to-Peer Overlay
//!
//! Everything between a TCP/UDP socket and a reactor.
//!
//! ```text
//!   ConManager ──dial──► Switch ◄──accept── TcpListener
//!       │                  │
//!       ▼                  ├── handshake ──► Peer ── MConnection ── socket
//!   DiscoverTable          │                  │
//!   (DhtTable | HttpTable) └── Reactor ◄──────┘ (by channel id)
//! ```
//!
//! ## Layers
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `node`        | `NodeId`, endpoints, XOR distance                       |
//! | `discover`    | Kademlia table over UDP, or the bootnode seed list      |
//! | `conn`        | framed, multiplexed, rate-limited TCP connection        |
//! | `handshake`   | signed `NodeInfo` exchange on a fresh stream            |
//! | `switch`      | admission, dialing, blacklist, reactor dispatch         |
//! | `con_manager` | outbound target maintenance and role changes           |
//!
//! The node's role and the bootnode list live in a shared [`NodeProfile`]
//! rather than in globals.

pub mod bootnode;
pub mod con_manager;
pub mod conn;
pub mod discover;
pub mod error;
pub mod handshake;
pub mod netutil;
pub mod node;
pub mod node_info;
pub mod peer;
pub mod peer_set;
pub mod profile;
pub mod reactor;
pub mod switch;

pub use bootnode::{BootnodeClient, BootnodeError, SeedSource};
pub use con_manager::{ConManager, DefaultTableFactory, TableFactory};
pub use discover::{DhtTable, DiscoverError, DiscoverTable, HttpTable, PeerDb};
pub use error::{P2pError, P2pResult};
pub use node::{Endpoint, Node, NodeId};
pub use node_info::NodeInfo;
pub use peer::Peer;
pub use profile::{NodeProfile, NodeRole};
pub use reactor::{ChannelDescriptor, Reactor};
pub use switch::{P2pConfig, Switch};
