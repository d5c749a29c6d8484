//! # Sync tracking
//!
//! Watches the local chain height and rebuilds the overlay when the node
//! stops making progress while the network moves on.
//!
//! | Check outcome     | Next check            |
//! |-------------------|-----------------------|
//! | progressing       | `check_interval`      |
//! | stalled (< 2)     | `check_interval`      |
//! | in sync           | `check_interval`      |
//! | rebootstrapped    | 10 s                  |
//! | bootnode failure  | 10 s                  |

pub mod height;

pub use height::{HeightCheck, HeightSource, SyncConfig, SyncHeightManager};
