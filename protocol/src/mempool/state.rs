//! In-memory account state implementing [`App`].
//!
//! Keeps two copies of every account: the committed state, advanced only by
//! [`MemoryApp::commit`], and the check state that successful state checks
//! mutate. The check state is what makes a sender's second transaction
//! pass with nonce `n + 1` before the first one is in a block.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::error::MempoolError;
use super::keyimage::KeyImageSet;
use super::transaction::{Transaction, TxOutput};
use super::tx::{Address, App, CheckKind, KeyImage, Tx, TxKind};

#[derive(Debug, Clone, Default)]
struct Accounts {
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, u128>,
}

impl Accounts {
    fn nonce(&self, addr: &Address) -> u64 {
        self.nonces.get(addr).copied().unwrap_or(0)
    }

    fn balance(&self, addr: &Address) -> u128 {
        self.balances.get(addr).copied().unwrap_or(0)
    }

    fn check_nonce(&self, addr: &Address, got: u64) -> Result<(), MempoolError> {
        let expected = self.nonce(addr);
        if got < expected {
            return Err(MempoolError::NonceTooLow { expected, got });
        }
        if got > expected {
            return Err(MempoolError::NonceTooHigh { expected, got });
        }
        Ok(())
    }

    fn debit(&mut self, addr: &Address, cost: u128) -> Result<(), MempoolError> {
        let balance = self.balance(addr);
        if balance < cost {
            return Err(MempoolError::InsufficientFunds { balance, cost });
        }
        self.balances.insert(*addr, balance - cost);
        Ok(())
    }

    fn credit(&mut self, addr: &Address, amount: u128) {
        let entry = self.balances.entry(*addr).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    fn bump_nonce(&mut self, addr: &Address) {
        *self.nonces.entry(*addr).or_insert(0) += 1;
    }

    /// Validates `tx` against this state without applying it.
    fn admits(&self, tx: &Transaction) -> Result<(), MempoolError> {
        let Some(from) = tx.from() else {
            return Ok(());
        };
        self.check_nonce(&from, tx.nonce)?;
        let (balance, cost) = (self.balance(&from), tx.cost());
        if balance < cost {
            return Err(MempoolError::InsufficientFunds { balance, cost });
        }
        Ok(())
    }

    /// Validates `tx` against this state and applies it. Nothing changes
    /// on error.
    fn apply(&mut self, tx: &Transaction) -> Result<(), MempoolError> {
        let Some(from) = tx.from() else {
            for (to, amount) in account_credits(tx) {
                self.credit(&to, amount);
            }
            return Ok(());
        };
        self.check_nonce(&from, tx.nonce)?;
        self.debit(&from, tx.cost())?;
        self.bump_nonce(&from);
        match tx.kind {
            TxKind::Utxo => {
                for (to, amount) in account_credits(tx) {
                    self.credit(&to, amount);
                }
            }
            TxKind::MultiSign => {}
            _ => {
                if let Some(to) = tx.to {
                    self.credit(&to, tx.value);
                }
            }
        }
        Ok(())
    }
}

fn account_credits(tx: &Transaction) -> Vec<(Address, u128)> {
    tx.outputs
        .iter()
        .filter_map(|o| match o {
            TxOutput::Account { to, amount } => Some((*to, *amount)),
            TxOutput::Utxo { .. } => None,
        })
        .collect()
}

#[derive(Default)]
pub struct MemoryApp {
    committed: Mutex<Accounts>,
    check: Mutex<Accounts>,
    spent: Mutex<HashSet<KeyImage>>,
    blacklist: Mutex<HashSet<Address>>,
}

impl MemoryApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the committed and check nonce of `addr`.
    pub fn set_nonce(&self, addr: Address, nonce: u64) {
        self.committed.lock().nonces.insert(addr, nonce);
        self.check.lock().nonces.insert(addr, nonce);
    }

    pub fn set_balance(&self, addr: Address, balance: u128) {
        self.committed.lock().balances.insert(addr, balance);
        self.check.lock().balances.insert(addr, balance);
    }

    pub fn blacklist(&self, addr: Address) {
        self.blacklist.lock().insert(addr);
    }

    pub fn committed_nonce(&self, addr: &Address) -> u64 {
        self.committed.lock().nonce(addr)
    }

    /// Applies a block to the committed state and resets the check state to
    /// it. Transactions that no longer apply are skipped.
    pub fn commit(&self, txs: &[Transaction]) {
        let mut committed = self.committed.lock();
        let mut spent = self.spent.lock();
        for tx in txs {
            if committed.apply(tx).is_ok() {
                spent.extend(tx.key_images());
            }
        }
        *self.check.lock() = committed.clone();
    }

    /// Discards check-state changes since the last commit.
    pub fn reset_check_state(&self) {
        let committed = self.committed.lock().clone();
        *self.check.lock() = committed;
    }
}

impl App<Transaction> for MemoryApp {
    fn nonce(&self, addr: &Address) -> u64 {
        self.check.lock().nonce(addr)
    }

    fn balance(&self, addr: &Address) -> u128 {
        self.check.lock().balance(addr)
    }

    fn check_tx(
        &self,
        tx: &Transaction,
        check: CheckKind,
        key_images: &KeyImageSet,
    ) -> Result<(), MempoolError> {
        match check {
            CheckKind::Basic => {
                if tx.kind != TxKind::Utxo && !(tx.inputs.is_empty() && tx.outputs.is_empty()) {
                    return Err(MempoolError::InvalidType);
                }
                if tx.kind == TxKind::Utxo {
                    if tx.inputs.is_empty() || tx.outputs.is_empty() {
                        return Err(MempoolError::Params("utxo tx needs inputs and outputs".into()));
                    }
                    if !tx.has_account_input() {
                        return Ok(());
                    }
                }
                if tx.verify_signature() {
                    Ok(())
                } else {
                    Err(MempoolError::InvalidSig)
                }
            }
            CheckKind::State | CheckKind::Staged => {
                let images = tx.key_images();
                if !images.is_empty() {
                    let spent = self.spent.lock();
                    if images.iter().any(|k| spent.contains(k)) || key_images.contains_any(&images)
                    {
                        return Err(MempoolError::UtxoDoubleSpend);
                    }
                }
                if check == CheckKind::Staged {
                    return self.check.lock().admits(tx);
                }
                self.check.lock().apply(tx)
            }
        }
    }

    fn is_blacklisted(&self, from: &Address, to: &Address, _token: &Address) -> bool {
        let list = self.blacklist.lock();
        (!from.is_zero() && list.contains(from)) || (!to.is_zero() && list.contains(to))
    }
}
