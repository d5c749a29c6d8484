//! Concrete transaction type carried by the node and its tests.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::tx::{Address, KeyImage, Tx, TxHash, TxKind};
use crate::crypto::{keccak256, NodeKey, PublicKey, Signature};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxInput {
    /// Spends a shielded output, identified by its keyimage.
    Utxo { key_image: KeyImage },
    /// Debits the signing account.
    Account { amount: u128 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutput {
    Utxo { commitment: [u8; 32], amount: u128 },
    Account { to: Address, amount: u128 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TxKind,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: u128,
    pub token: Address,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub payload: Vec<u8>,
    pub sender: Option<PublicKey>,
    pub signature: Vec<u8>,
    #[serde(skip)]
    hash: OnceLock<TxHash>,
}

#[derive(Serialize)]
struct SigningView<'a> {
    kind: TxKind,
    nonce: u64,
    to: &'a Option<Address>,
    value: u128,
    token: &'a Address,
    inputs: &'a [TxInput],
    outputs: &'a [TxOutput],
    payload: &'a [u8],
    sender: &'a Option<PublicKey>,
}

impl Transaction {
    pub fn new(kind: TxKind, nonce: u64) -> Self {
        Self {
            kind,
            nonce,
            to: None,
            value: 0,
            token: Address::ZERO,
            inputs: Vec::new(),
            outputs: Vec::new(),
            payload: Vec::new(),
            sender: None,
            signature: Vec::new(),
            hash: OnceLock::new(),
        }
    }

    pub fn transfer(nonce: u64, to: Address, value: u128) -> Self {
        Self {
            to: Some(to),
            value,
            ..Self::new(TxKind::Normal, nonce)
        }
    }

    pub fn utxo(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            inputs,
            outputs,
            ..Self::new(TxKind::Utxo, 0)
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self.hash = OnceLock::new();
        self
    }

    /// Binds the transaction to `key`. The account address becomes
    /// [`Address::from_public_key`] of the key.
    pub fn sign(mut self, key: &NodeKey) -> Self {
        self.sender = Some(key.public_key());
        let sig = key.sign(&self.signing_hash());
        self.signature = sig.as_bytes().to_vec();
        self.hash = OnceLock::new();
        self
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        let view = SigningView {
            kind: self.kind,
            nonce: self.nonce,
            to: &self.to,
            value: self.value,
            token: &self.token,
            inputs: &self.inputs,
            outputs: &self.outputs,
            payload: &self.payload,
            sender: &self.sender,
        };
        keccak256(&bincode::serialize(&view).unwrap_or_default())
    }

    pub fn verify_signature(&self) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match Signature::from_bytes(&self.signature) {
            Ok(sig) => sender.verify(&self.signing_hash(), &sig),
            Err(_) => false,
        }
    }

    pub fn has_account_input(&self) -> bool {
        self.inputs
            .iter()
            .any(|i| matches!(i, TxInput::Account { .. }))
    }

    /// Amount debited from the sender's account.
    pub fn cost(&self) -> u128 {
        match self.kind {
            TxKind::Utxo => self
                .inputs
                .iter()
                .map(|i| match i {
                    TxInput::Account { amount } => *amount,
                    TxInput::Utxo { .. } => 0,
                })
                .sum(),
            TxKind::MultiSign => 0,
            _ => self.value,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl Tx for Transaction {
    fn hash(&self) -> TxHash {
        *self
            .hash
            .get_or_init(|| TxHash(keccak256(&bincode::serialize(self).unwrap_or_default())))
    }

    fn kind(&self) -> TxKind {
        self.kind
    }

    fn from(&self) -> Option<Address> {
        if self.kind == TxKind::Utxo && !self.has_account_input() {
            return None;
        }
        self.sender.as_ref().map(Address::from_public_key)
    }

    fn to(&self) -> Option<Address> {
        self.to
    }

    fn nonce(&self) -> u64 {
        self.nonce
    }

    fn token(&self) -> Address {
        self.token
    }

    fn key_images(&self) -> Vec<KeyImage> {
        self.inputs
            .iter()
            .filter_map(|i| match i {
                TxInput::Utxo { key_image } => Some(*key_image),
                TxInput::Account { .. } => None,
            })
            .collect()
    }

    fn account_outputs(&self) -> Vec<Address> {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                TxOutput::Account { to, .. } => Some(*to),
                TxOutput::Utxo { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_transfer_verifies() {
        let key = NodeKey::from_seed(&[1; 32]);
        let tx = Transaction::transfer(0, Address([9; 20]), 5).sign(&key);
        assert!(tx.verify_signature());
        assert_eq!(tx.from(), Some(Address::from_public_key(&key.public_key())));
    }

    #[test]
    fn tampering_breaks_signature_and_hash() {
        let key = NodeKey::from_seed(&[1; 32]);
        let tx = Transaction::transfer(0, Address([9; 20]), 5).sign(&key);
        let mut forged = tx.clone();
        forged.value = 500;
        forged.hash = OnceLock::new();
        assert!(!forged.verify_signature());
        assert_ne!(forged.hash(), tx.hash());
    }

    #[test]
    fn pure_utxo_has_no_sender() {
        let tx = Transaction::utxo(
            vec![TxInput::Utxo {
                key_image: KeyImage([4; 32]),
            }],
            vec![TxOutput::Account {
                to: Address([2; 20]),
                amount: 3,
            }],
        );
        assert!(tx.is_pure_utxo());
        assert_eq!(tx.key_images(), vec![KeyImage([4; 32])]);
        assert_eq!(tx.account_outputs(), vec![Address([2; 20])]);
    }

    #[test]
    fn decode_keeps_hash() {
        let key = NodeKey::from_seed(&[3; 32]);
        let tx = Transaction::transfer(2, Address([1; 20]), 1).sign(&key);
        let decoded = Transaction::decode(&tx.encode().unwrap()).unwrap();
        assert_eq!(decoded.hash(), tx.hash());
        assert!(decoded.verify_signature());
    }
}
