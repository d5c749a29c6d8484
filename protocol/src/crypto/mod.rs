//! # Cryptographic Primitives
//!
//! Thin, typed wrappers around audited crates:
//!
//! - **Ed25519** (`ed25519-dalek`) for node identity keys and signatures.
//! - **Keccak-256** (`sha3`) for node ids, packet MACs and tx hashes.
//! - **MD5** (`md-5`) for the bootnode challenge only.

pub mod hash;
pub mod keys;

pub use hash::{keccak256, keccak256_concat, md5_digest};
pub use keys::{KeyError, NodeKey, PublicKey, Signature};
