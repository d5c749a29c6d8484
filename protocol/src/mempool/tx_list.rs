//! Nonce-ordered queue of one sender's future transactions.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::tx::Tx;

pub struct TxList<T> {
    txs: BTreeMap<u64, Arc<T>>,
}

impl<T: Tx> TxList<T> {
    pub fn new() -> Self {
        Self {
            txs: BTreeMap::new(),
        }
    }

    /// Inserts `tx` at its nonce. A slot that is already taken is kept and
    /// `false` is returned.
    pub fn add(&mut self, tx: Arc<T>) -> bool {
        let nonce = tx.nonce();
        if self.txs.contains_key(&nonce) {
            return false;
        }
        self.txs.insert(nonce, tx);
        true
    }

    pub fn get(&self, nonce: u64) -> Option<&Arc<T>> {
        self.txs.get(&nonce)
    }

    /// Removes and returns every transaction with a nonce below `threshold`.
    pub fn forward(&mut self, threshold: u64) -> Vec<Arc<T>> {
        let keep = self.txs.split_off(&threshold);
        let removed = std::mem::replace(&mut self.txs, keep);
        removed.into_values().collect()
    }

    /// Removes and returns the gapless run starting at `start`, stopping
    /// before `end`.
    pub fn ready(&mut self, start: u64, end: u64) -> Vec<Arc<T>> {
        let mut out = Vec::new();
        let mut next = start;
        while next < end {
            match self.txs.remove(&next) {
                Some(tx) => out.push(tx),
                None => break,
            }
            next += 1;
        }
        out
    }

    /// Drops the highest nonces until at most `limit` remain.
    pub fn cap(&mut self, limit: usize) -> Vec<Arc<T>> {
        let mut dropped = Vec::new();
        while self.txs.len() > limit {
            match self.txs.pop_last() {
                Some((_, tx)) => dropped.push(tx),
                None => break,
            }
        }
        dropped
    }

    pub fn remove(&mut self, nonce: u64) -> Option<Arc<T>> {
        self.txs.remove(&nonce)
    }

    /// Removes and returns the highest-nonce transaction.
    pub fn pop_last(&mut self) -> Option<Arc<T>> {
        self.txs.pop_last().map(|(_, tx)| tx)
    }

    /// Ascending by nonce.
    pub fn flatten(&self) -> Vec<Arc<T>> {
        self.txs.values().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<Arc<T>> {
        std::mem::take(&mut self.txs).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

impl<T: Tx> Default for TxList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::tx::{Address, TxHash, TxKind};

    struct Stub(u64);

    impl Tx for Stub {
        fn hash(&self) -> TxHash {
            TxHash([self.0 as u8; 32])
        }
        fn kind(&self) -> TxKind {
            TxKind::Normal
        }
        fn from(&self) -> Option<Address> {
            Some(Address([1; 20]))
        }
        fn to(&self) -> Option<Address> {
            None
        }
        fn nonce(&self) -> u64 {
            self.0
        }
    }

    fn list(nonces: &[u64]) -> TxList<Stub> {
        let mut l = TxList::new();
        for n in nonces {
            assert!(l.add(Arc::new(Stub(*n))));
        }
        l
    }

    fn nonces(txs: &[Arc<Stub>]) -> Vec<u64> {
        txs.iter().map(|t| t.nonce()).collect()
    }

    #[test]
    fn add_rejects_taken_nonce() {
        let mut l = list(&[3]);
        assert!(!l.add(Arc::new(Stub(3))));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn forward_drops_stale() {
        let mut l = list(&[1, 2, 5, 7]);
        assert_eq!(nonces(&l.forward(5)), vec![1, 2]);
        assert_eq!(nonces(&l.flatten()), vec![5, 7]);
    }

    #[test]
    fn ready_stops_at_gap_and_end() {
        let mut l = list(&[4, 5, 6, 8]);
        assert_eq!(nonces(&l.ready(4, 100)), vec![4, 5, 6]);
        assert_eq!(nonces(&l.flatten()), vec![8]);

        let mut l = list(&[1, 2, 3]);
        assert_eq!(nonces(&l.ready(1, 3)), vec![1, 2]);
        assert!(l.ready(9, 20).is_empty());
    }

    #[test]
    fn cap_drops_tail() {
        let mut l = list(&[1, 2, 3, 4]);
        assert_eq!(nonces(&l.cap(2)), vec![4, 3]);
        assert_eq!(nonces(&l.flatten()), vec![1, 2]);
        assert!(l.cap(5).is_empty());
    }
}
