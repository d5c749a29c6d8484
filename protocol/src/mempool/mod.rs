//! # Mempool
//!
//! Admission, ordering and gossip of transactions waiting for a block.
//!
//! ```text
//!   peers ──► MempoolReactor ──► Mempool::add_tx ──► pending ──► reap
//!                  ▲                   │               ▲
//!                  └── hash notify ◄───┘            future (nonce gaps)
//! ```
//!
//! Validity is never decided here. The pool asks an [`App`] for signature,
//! nonce, balance and keyimage checks, and only tracks where each accepted
//! transaction waits.

pub mod cache;
pub mod error;
pub mod keyimage;
pub mod pool;
pub mod reactor;
pub mod state;
pub mod transaction;
pub mod tx;
pub mod tx_list;

pub use error::MempoolError;
pub use keyimage::KeyImageSet;
pub use pool::{Mempool, MempoolConfig, MempoolGuard, MempoolStats};
pub use reactor::{HashKind, MempoolMessage, MempoolReactor, TxHashMessage};
pub use state::MemoryApp;
pub use transaction::{Transaction, TxInput, TxOutput};
pub use tx::{Address, App, CheckKind, KeyImage, Tx, TxHash, TxKind};
