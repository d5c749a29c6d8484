//! # Transaction Capabilities
//!
//! The pool never looks inside a transaction beyond what [`Tx`] exposes, and
//! never decides validity on its own: signature, nonce, balance and keyimage
//! checks are delegated to an [`App`].
//!
//! | Kind              | Pool list        | Nonce-ordered |
//! |-------------------|------------------|---------------|
//! | `Normal`, `Token` | pending / future | yes           |
//! | `ContractCreate`  | pending / future | yes           |
//! | `ContractUpgrade` | pending / future | yes           |
//! | `MultiSign`       | special          | no            |
//! | `Utxo` w/ account | pending / future | yes           |
//! | `Utxo` pure       | utxo             | no            |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::MempoolError;
use super::keyimage::KeyImageSet;
use crate::crypto::{keccak256, PublicKey};

macro_rules! fixed_bytes {
    ($name:ident, $len:expr) => {
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {e}"))?;
                let arr: [u8; $len] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| format!("expected {} bytes, got {}", $len, bytes.len()))?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}..)", stringify!($name), &self.to_hex()[..8])
            }
        }
    };
}

fixed_bytes!(Address, 20);
fixed_bytes!(TxHash, 32);
fixed_bytes!(KeyImage, 32);

impl Address {
    /// Stands in for "no address" in blacklist queries.
    pub const ZERO: Address = Address([0u8; 20]);

    /// Last 20 bytes of `keccak256(pubkey)`.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = keccak256(key.as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Self(out)
    }
}

// ---------------------------------------------------------------------------
// TxKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Normal,
    Token,
    ContractCreate,
    ContractUpgrade,
    MultiSign,
    Utxo,
}

impl TxKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Token => "token",
            Self::ContractCreate => "contract_create",
            Self::ContractUpgrade => "contract_upgrade",
            Self::MultiSign => "multisign",
            Self::Utxo => "utxo",
        }
    }

    /// Whether a sender's future queue is promoted after one of these lands
    /// in the pending list.
    pub fn is_promotable(&self) -> bool {
        !matches!(self, Self::MultiSign)
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Tx
// ---------------------------------------------------------------------------

/// What the pool needs to know about a transaction.
pub trait Tx: Send + Sync + 'static {
    fn hash(&self) -> TxHash;

    fn kind(&self) -> TxKind;

    /// Account sender. `None` for UTXO transactions without an account input.
    fn from(&self) -> Option<Address>;

    fn to(&self) -> Option<Address>;

    fn nonce(&self) -> u64;

    /// Token contract; [`Address::ZERO`] for the native coin.
    fn token(&self) -> Address {
        Address::ZERO
    }

    fn key_images(&self) -> Vec<KeyImage> {
        Vec::new()
    }

    /// Account recipients among the outputs of a UTXO transaction.
    fn account_outputs(&self) -> Vec<Address> {
        Vec::new()
    }

    /// A UTXO transaction with no account input.
    fn is_pure_utxo(&self) -> bool {
        self.kind() == TxKind::Utxo && self.from().is_none()
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// Signature and structure only. Stateless.
    Basic,
    /// Nonce, balance and keyimage checks against the check state. A
    /// successful state check applies the transaction to that state.
    State,
    /// The same checks as `State`, leaving the check state untouched. Used
    /// for ready transactions parked in the future queue.
    Staged,
}

/// The state collaborator the pool delegates validation to.
///
/// `nonce` must reflect transactions that already passed a state check, so
/// the pool can ask for the next executable nonce of a sender.
pub trait App<T: Tx>: Send + Sync {
    fn nonce(&self, addr: &Address) -> u64;

    fn balance(&self, addr: &Address) -> u128;

    fn check_tx(&self, tx: &T, check: CheckKind, key_images: &KeyImageSet)
        -> Result<(), MempoolError>;

    fn is_blacklisted(&self, _from: &Address, _to: &Address, _token: &Address) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;

    #[test]
    fn address_from_key_is_stable() {
        let key = NodeKey::from_seed(&[7u8; 32]);
        let a = Address::from_public_key(&key.public_key());
        let b = Address::from_public_key(&key.public_key());
        assert_eq!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn hex_parse_accepts_prefix() {
        let hash: TxHash = format!("0x{}", "ab".repeat(32)).parse().unwrap();
        assert_eq!(hash.0, [0xab; 32]);
        assert!("abcd".parse::<TxHash>().is_err());
        assert_eq!(hash.to_string(), format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn multisign_is_not_promotable() {
        assert!(!TxKind::MultiSign.is_promotable());
        assert!(TxKind::Utxo.is_promotable());
    }
}
