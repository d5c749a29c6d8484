// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # LinkMesh Protocol: Core Library
//!
//! The networking and transaction-pool layer a LinkMesh node runs under its
//! consensus engine.
//!
//! ## Architecture
//!
//! - **crypto**: Ed25519 node keys and Keccak hashing.
//! - **p2p**: Node identities, peer database, Kademlia and seed-list
//!   discovery, multiplexed TCP connections, the switch and the connection
//!   manager.
//! - **mempool**: Pending/future/special/UTXO transaction lists, keyimage
//!   tracking and the gossip reactor on channel `0x30`.
//! - **sync**: Stalled-height detection and overlay rebuild.
//! - **config**: Protocol constants and network parameters.
//!
//! ## Design Philosophy
//!
//! 1. The pool never decides validity; the embedding application does.
//! 2. Every background loop listens on a quit signal and exits promptly.
//! 3. Peers that send garbage are disconnected, never trusted twice.

pub mod config;
pub mod crypto;
pub mod mempool;
pub mod p2p;
pub mod sync;
