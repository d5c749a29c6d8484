//! Admission and state-check errors.

use std::fmt;

/// Why a transaction was refused or dropped.
///
/// The same enum is returned by the state collaborator's checks, so the
/// pool can tell "come back later" (`NonceTooHigh`) from "never" (the rest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    /// The hash is already in the seen cache.
    Duplicate,

    /// The target list is at capacity.
    MempoolFull,

    /// The nonce is below the sender's account nonce.
    NonceTooLow { expected: u64, got: u64 },

    /// The nonce leaves a gap after the sender's account nonce.
    NonceTooHigh { expected: u64, got: u64 },

    /// The sender cannot cover the transferred amount.
    InsufficientFunds { balance: u128, cost: u128 },

    /// A keyimage is already spent or already pending.
    UtxoDoubleSpend,

    /// A sender, recipient or output address is blacklisted.
    BlacklistAddress,

    /// Missing or invalid signature.
    InvalidSig,

    /// The kind does not match the transaction's shape.
    InvalidType,

    /// Structurally malformed transaction.
    Params(String),

    Other(String),
}

impl MempoolError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::MempoolFull => "full",
            Self::NonceTooLow { .. } => "nonce_too_low",
            Self::NonceTooHigh { .. } => "nonce_too_high",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::UtxoDoubleSpend => "utxo_double_spend",
            Self::BlacklistAddress => "blacklist_address",
            Self::InvalidSig => "invalid_sig",
            Self::InvalidType => "invalid_type",
            Self::Params(_) => "params",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for MempoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "transaction already in mempool cache"),
            Self::MempoolFull => write!(f, "mempool is full"),
            Self::NonceTooLow { expected, got } => {
                write!(f, "nonce too low: expected {expected}, got {got}")
            }
            Self::NonceTooHigh { expected, got } => {
                write!(f, "nonce too high: expected {expected}, got {got}")
            }
            Self::InsufficientFunds { balance, cost } => {
                write!(f, "insufficient funds: balance {balance}, cost {cost}")
            }
            Self::UtxoDoubleSpend => write!(f, "utxo keyimage already spent"),
            Self::BlacklistAddress => write!(f, "address is blacklisted"),
            Self::InvalidSig => write!(f, "invalid signature"),
            Self::InvalidType => write!(f, "transaction kind does not match its contents"),
            Self::Params(reason) => write!(f, "invalid parameters: {reason}"),
            Self::Other(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for MempoolError {}
