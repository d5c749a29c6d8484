//! # Hashing Utilities
//!
//! Two hash functions, each with a narrow job:
//!
//! - **Keccak-256** is the identity and wire hash. Node ids, UDP packet
//!   MACs, the data covered by discovery signatures, random lookup targets
//!   and transaction hashes all go through it.
//!
//! - **MD5** appears in exactly one place: the bootnode API expects the
//!   signed challenge to be `md5("time=<unix>")`. It is never used for
//!   anything that needs collision resistance.

use md5::Md5;
use sha3::{Digest, Keccak256};

/// Compute the Keccak-256 digest of `data`.
///
/// # Example
///
/// ```
/// use linkmesh_protocol::crypto::keccak256;
///
/// let hash = keccak256(b"");
/// assert_eq!(hash[0], 0xc5);
/// ```
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Keccak-256 over the concatenation of several slices, without building an
/// intermediate buffer.
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Compute the MD5 digest of `data`. Only for the bootnode challenge.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}
