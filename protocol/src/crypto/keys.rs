//! # Node Keys
//!
//! Ed25519 keypairs that give every node its long-term identity. The node id
//! is `keccak256(public_key)`, so a key is the one thing that survives a
//! restart unchanged.
//!
//! ## Wire slots
//!
//! The discovery header reserves fixed-width slots for the signature and the
//! public key. Ed25519 values are shorter than those slots, so both are
//! written length-prefixed and zero-padded:
//!
//! ```text
//! signature slot (73 bytes): len(1) || sig(64) || 0x00 * 8
//! pubkey slot    (40 bytes): tag(1) || len(1) || key(32) || 0x00 * 6
//! ```
//!
//! Decoding checks the tag, the length and the padding, so a slot has
//! exactly one valid encoding for a given key.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use super::hash::keccak256;
use crate::config::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, UDP_PUBKEY_SIZE, UDP_SIG_SIZE};
use crate::p2p::node::NodeId;

/// Key type tag written in front of an encoded public key.
const KEY_TAG_ED25519: u8 = 0x01;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// NodeKey
// ---------------------------------------------------------------------------

/// The long-term private key of a node.
///
/// Deliberately not `Serialize`: writing a secret to disk goes through
/// [`NodeKey::save`] and nowhere else.
pub struct NodeKey {
    signing_key: SigningKey,
}

impl NodeKey {
    /// Generate a fresh key from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Build a key from a 32-byte seed. Deterministic; handy in tests.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a hex-encoded 32-byte secret.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Load a hex-encoded key from `path`.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_hex(&contents)
    }

    /// Load the key at `path`, generating and persisting a new one if the
    /// file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            return Self::load(path);
        }
        let key = Self::generate();
        key.save(path)?;
        Ok(key)
    }

    /// Write the secret as hex to `path`, owner-readable only on Unix.
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(self.signing_key.to_bytes()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Shorthand for `self.public_key().node_id()`.
    pub fn node_id(&self) -> NodeId {
        self.public_key().node_id()
    }

    /// Sign an arbitrary message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.signing_key.sign(message).to_bytes(),
        }
    }
}

impl Clone for NodeKey {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey(id={})", self.node_id())
    }
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// An Ed25519 public key. Validated as a curve point on construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; PUBLIC_KEY_LENGTH],
}

impl PublicKey {
    /// Accept 32 bytes that decode to a valid point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Parse a hex string, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// `keccak256(pubkey)`.
    pub fn node_id(&self) -> NodeId {
        NodeId::from(keccak256(&self.bytes))
    }

    /// Check `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let sig = DalekSignature::from_bytes(&signature.bytes);
        key.verify(message, &sig).is_ok()
    }

    /// Encode into the fixed discovery header slot.
    pub fn to_wire(&self) -> [u8; UDP_PUBKEY_SIZE] {
        let mut out = [0u8; UDP_PUBKEY_SIZE];
        out[0] = KEY_TAG_ED25519;
        out[1] = PUBLIC_KEY_LENGTH as u8;
        out[2..2 + PUBLIC_KEY_LENGTH].copy_from_slice(&self.bytes);
        out
    }

    /// Decode from the fixed discovery header slot.
    pub fn from_wire(slot: &[u8]) -> Result<Self, KeyError> {
        if slot.len() != UDP_PUBKEY_SIZE
            || slot[0] != KEY_TAG_ED25519
            || slot[1] as usize != PUBLIC_KEY_LENGTH
            || slot[2 + PUBLIC_KEY_LENGTH..].iter().any(|b| *b != 0)
        {
            return Err(KeyError::InvalidPublicKey);
        }
        Self::from_bytes(&slot[2..2 + PUBLIC_KEY_LENGTH])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; SIGNATURE_LENGTH],
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; SIGNATURE_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSignature)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Encode into the fixed discovery header slot.
    pub fn to_wire(&self) -> [u8; UDP_SIG_SIZE] {
        let mut out = [0u8; UDP_SIG_SIZE];
        out[0] = SIGNATURE_LENGTH as u8;
        out[1..1 + SIGNATURE_LENGTH].copy_from_slice(&self.bytes);
        out
    }

    /// Decode from the fixed discovery header slot.
    pub fn from_wire(slot: &[u8]) -> Result<Self, KeyError> {
        if slot.len() != UDP_SIG_SIZE
            || slot[0] as usize != SIGNATURE_LENGTH
            || slot[1 + SIGNATURE_LENGTH..].iter().any(|b| *b != 0)
        {
            return Err(KeyError::InvalidSignature);
        }
        Self::from_bytes(&slot[1..1 + SIGNATURE_LENGTH])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &self.to_hex()[..16])
    }
}

// Signatures travel inside bincode-encoded handshake messages; serde has no
// impl for `[u8; 64]`, so they go over as a byte vector.
impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.bytes)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        Signature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let key = NodeKey::generate();
        let sig = key.sign(b"ping");
        assert!(key.public_key().verify(b"ping", &sig));
        assert!(!key.public_key().verify(b"pong", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let a = NodeKey::generate();
        let b = NodeKey::generate();
        let sig = a.sign(b"msg");
        assert!(!b.public_key().verify(b"msg", &sig));
    }

    #[test]
    fn node_id_is_keccak_of_pubkey() {
        let key = NodeKey::from_seed(&[7u8; 32]);
        let expected = keccak256(key.public_key().as_bytes());
        assert_eq!(key.node_id().as_bytes(), &expected);
    }

    #[test]
    fn seed_is_deterministic() {
        let a = NodeKey::from_seed(&[1u8; 32]);
        let b = NodeKey::from_seed(&[1u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn cloned_key_keeps_identity() {
        let key = NodeKey::generate();
        let copy = key.clone();
        assert_eq!(copy.node_id(), key.node_id());
        assert_eq!(copy.sign(b"msg"), key.sign(b"msg"));
    }

    #[test]
    fn pubkey_wire_slot_roundtrip() {
        let key = NodeKey::generate().public_key();
        let slot = key.to_wire();
        assert_eq!(slot.len(), UDP_PUBKEY_SIZE);
        assert_eq!(PublicKey::from_wire(&slot).unwrap(), key);
    }

    #[test]
    fn pubkey_wire_slot_rejects_dirty_padding() {
        let mut slot = NodeKey::generate().public_key().to_wire();
        slot[UDP_PUBKEY_SIZE - 1] = 1;
        assert!(PublicKey::from_wire(&slot).is_err());
    }

    #[test]
    fn signature_wire_slot_roundtrip() {
        let key = NodeKey::generate();
        let sig = key.sign(b"data");
        let slot = sig.to_wire();
        assert_eq!(slot.len(), UDP_SIG_SIZE);
        assert_eq!(Signature::from_wire(&slot).unwrap(), sig);
    }

    #[test]
    fn hex_key_roundtrip_and_rejects_garbage() {
        let key = NodeKey::generate();
        let restored = NodeKey::from_hex(&hex::encode(key.signing_key.to_bytes())).unwrap();
        assert_eq!(key.public_key(), restored.public_key());
        assert!(NodeKey::from_hex("deadbeef").is_err());
        assert!(NodeKey::from_hex("zz").is_err());
    }

    #[test]
    fn load_or_generate_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        let first = NodeKey::load_or_generate(&path).unwrap();
        let second = NodeKey::load_or_generate(&path).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn signature_bincode_roundtrip() {
        let sig = NodeKey::generate().sign(b"x");
        let bytes = bincode::serialize(&sig).unwrap();
        let back: Signature = bincode::deserialize(&bytes).unwrap();
        assert_eq!(sig, back);
    }
}
