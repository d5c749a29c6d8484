//! Stalled-height watchdog.
//!
//! Samples the local chain height every `check_interval`. After
//! [`MAX_SAME_HEIGHT_COUNT`] samples without progress it asks the bootnode
//! for the network height; if the node is [`HEIGHT_LAG_THRESHOLD`] or more
//! blocks behind, the overlay is rebuilt from fresh seeds on the assumption
//! that the current peers are stuck or isolated.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HEIGHT_LAG_THRESHOLD, MAX_SAME_HEIGHT_COUNT, MIN_HEIGHT_CHECK_INTERVAL};
use crate::p2p::{ConManager, SeedSource};

/// The embedding application's view of its own chain.
pub trait HeightSource: Send + Sync {
    fn height(&self) -> u64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Clamped to at least 10 s.
    pub check_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: MIN_HEIGHT_CHECK_INTERVAL.as_secs(),
        }
    }
}

impl SyncConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs).max(MIN_HEIGHT_CHECK_INTERVAL)
    }
}

/// What one height check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightCheck {
    /// The local height moved.
    Progressing,
    /// No progress yet; the count of stagnant samples so far.
    Stalled(u32),
    /// Stagnant, but the network is not ahead either.
    InSync,
    /// Fell behind; the overlay was rebuilt.
    Rebootstrapped,
    /// Bootnode unreachable or the rebuild failed; retried soon.
    Failed,
}

#[derive(Debug, Default)]
struct CheckState {
    last_height: u64,
    same_count: u32,
}

pub struct SyncHeightManager {
    con_manager: Arc<ConManager>,
    source: Arc<dyn SeedSource>,
    chain: Arc<dyn HeightSource>,
    interval: Duration,
    state: Mutex<CheckState>,
    quit: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHeightManager {
    pub fn new(
        config: &SyncConfig,
        con_manager: Arc<ConManager>,
        source: Arc<dyn SeedSource>,
        chain: Arc<dyn HeightSource>,
    ) -> Arc<Self> {
        let interval = config.check_interval();
        if interval.as_secs() != config.check_interval_secs {
            info!(?interval, "check interval raised to the minimum");
        }
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(CheckState {
                last_height: chain.height(),
                same_count: 0,
            }),
            con_manager,
            source,
            chain,
            interval,
            quit,
            task: Mutex::new(None),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut quit = self.quit.subscribe();
        let handle = tokio::spawn(async move {
            let mut delay = this.interval;
            loop {
                tokio::select! {
                    _ = quit.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let (outcome, next) = this.check_once().await;
                debug!(?outcome, "height check");
                delay = next;
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.quit.send_replace(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Runs one height check and returns the delay before the next.
    pub async fn check_once(&self) -> (HeightCheck, Duration) {
        let current = self.chain.height();
        {
            let mut state = self.state.lock();
            if state.same_count < MAX_SAME_HEIGHT_COUNT {
                if current == state.last_height {
                    state.same_count += 1;
                } else {
                    state.same_count = 0;
                }
                state.last_height = current;
                let outcome = if state.same_count == 0 {
                    HeightCheck::Progressing
                } else {
                    HeightCheck::Stalled(state.same_count)
                };
                return (outcome, self.interval);
            }
            if current > state.last_height {
                state.same_count = 0;
                state.last_height = current;
                return (HeightCheck::Progressing, self.interval);
            }
            state.last_height = current;
        }

        let network = match self.source.current_height().await {
            Ok(h) => h,
            Err(err) => {
                warn!(err = %err, "bootnode height query failed");
                return (HeightCheck::Failed, MIN_HEIGHT_CHECK_INTERVAL);
            }
        };
        if network < current.saturating_add(HEIGHT_LAG_THRESHOLD) {
            self.state.lock().same_count = 0;
            return (HeightCheck::InSync, self.interval);
        }

        let (seeds, role) = match self.source.get_seeds().await {
            Ok(r) => r,
            Err(err) => {
                warn!(err = %err, "bootnode seeds query failed");
                return (HeightCheck::Failed, MIN_HEIGHT_CHECK_INTERVAL);
            }
        };
        info!(network, local = current, seeds = seeds.len(), "behind the chain, fetching new seeds");
        self.con_manager.connect_to_new_seeds(seeds.clone()).await;
        if let Err(err) = self.con_manager.renew_table(seeds, role).await {
            warn!(err = %err, "table rebuild failed");
            return (HeightCheck::Failed, MIN_HEIGHT_CHECK_INTERVAL);
        }
        (HeightCheck::Rebootstrapped, MIN_HEIGHT_CHECK_INTERVAL)
    }
}
