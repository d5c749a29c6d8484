//! # Prometheus Metrics
//!
//! Overlay and pool gauges under the `linkmesh` namespace, sampled from the
//! switch and the mempool by a background task and served at `/metrics`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use linkmesh_protocol::mempool::MempoolStats;

pub struct NodeMetrics {
    registry: Registry,
    pub connected_peers: IntGauge,
    pub outbound_peers: IntGauge,
    pub mempool_pending: IntGauge,
    pub mempool_future: IntGauge,
    pub mempool_special: IntGauge,
    pub mempool_rejected_total: IntCounter,
    /// Last rejection total seen, so the counter only moves forward by deltas.
    rejected_seen: AtomicU64,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("linkmesh".into()), None)?;

        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let connected_peers = gauge("connected_peers", "Connected peers, both directions")?;
        let outbound_peers = gauge("outbound_peers", "Peers we dialed")?;
        let mempool_pending = gauge("mempool_pending", "Executable transactions, UTXO list included")?;
        let mempool_future = gauge("mempool_future", "Transactions waiting on a nonce gap")?;
        let mempool_special = gauge("mempool_special", "Multi-signature transactions")?;

        let mempool_rejected_total =
            IntCounter::new("mempool_rejected_total", "Transactions the pool refused")?;
        registry.register(Box::new(mempool_rejected_total.clone()))?;

        Ok(Self {
            registry,
            connected_peers,
            outbound_peers,
            mempool_pending,
            mempool_future,
            mempool_special,
            mempool_rejected_total,
            rejected_seen: AtomicU64::new(0),
        })
    }

    pub fn observe_peers(&self, outbound: usize, inbound: usize) {
        self.connected_peers.set((outbound + inbound) as i64);
        self.outbound_peers.set(outbound as i64);
    }

    pub fn observe_mempool(&self, stats: &MempoolStats) {
        self.mempool_pending.set((stats.pending + stats.utxo) as i64);
        self.mempool_future.set(stats.future as i64);
        self.mempool_special.set(stats.special as i64);
        let prev = self.rejected_seen.swap(stats.rejected, Ordering::Relaxed);
        if stats.rejected > prev {
            self.mempool_rejected_total.inc_by(stats.rejected - prev);
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(rejected: u64) -> MempoolStats {
        MempoolStats {
            height: 1,
            pending: 3,
            utxo: 2,
            special: 1,
            future: 7,
            senders: 2,
            cached: 13,
            key_images: 2,
            rejected,
        }
    }

    #[test]
    fn gauges_follow_observations() {
        let m = NodeMetrics::new().unwrap();
        m.observe_peers(2, 3);
        m.observe_mempool(&stats(4));
        assert_eq!(m.connected_peers.get(), 5);
        assert_eq!(m.outbound_peers.get(), 2);
        assert_eq!(m.mempool_pending.get(), 5);
        assert_eq!(m.mempool_future.get(), 7);
        assert_eq!(m.mempool_rejected_total.get(), 4);

        m.observe_mempool(&stats(6));
        assert_eq!(m.mempool_rejected_total.get(), 6);
    }

    #[test]
    fn encoding_uses_namespace() {
        let m = NodeMetrics::new().unwrap();
        let text = m.encode().unwrap();
        assert!(text.contains("linkmesh_connected_peers"));
        assert!(text.contains("linkmesh_mempool_rejected_total"));
    }
}
