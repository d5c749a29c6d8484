//! # Status API
//!
//! A read-only HTTP interface over the running node.
//!
//! ## Endpoints
//!
//! | Method | Path       | Description                              |
//! |--------|------------|------------------------------------------|
//! | GET    | `/health`  | Liveness check                           |
//! | GET    | `/status`  | Node id, network, peer counts, pool stats |
//! | GET    | `/peers`   | Connected peers                          |
//! | GET    | `/metrics` | Prometheus exposition                    |

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use linkmesh_protocol::mempool::{Mempool, MempoolStats, Transaction};
use linkmesh_protocol::p2p::{NodeRole, Switch};

use crate::metrics::{self, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub network: String,
    pub switch: Arc<Switch>,
    pub mempool: Arc<Mempool<Transaction>>,
    pub metrics: SharedMetrics,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/peers", get(peers_handler))
        .route("/metrics", get(metrics_route))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PeerCounts {
    pub outbound: usize,
    pub inbound: usize,
    pub dialing: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub moniker: String,
    pub role: NodeRole,
    pub version: String,
    pub network: String,
    pub listen_addr: String,
    pub peers: PeerCounts,
    pub mempool: MempoolStats,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct PeerResponse {
    pub node_id: String,
    pub moniker: String,
    pub remote_addr: String,
    pub listen_addr: String,
    pub outbound: bool,
    pub connected_secs: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let info = state.switch.local_info();
    let (outbound, inbound, dialing) = state.switch.num_peers();
    Json(StatusResponse {
        node_id: state.switch.node_id().to_string(),
        moniker: info.moniker,
        role: info.role,
        version: state.version.clone(),
        network: state.network.clone(),
        listen_addr: info.listen_addr,
        peers: PeerCounts {
            outbound,
            inbound,
            dialing,
        },
        mempool: state.mempool.stats(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn peers_handler(State(state): State<AppState>) -> Json<Vec<PeerResponse>> {
    let peers = state
        .switch
        .peers()
        .list()
        .into_iter()
        .map(|p| {
            let status = p.status();
            PeerResponse {
                node_id: p.id().to_string(),
                moniker: p.info().moniker.clone(),
                remote_addr: p.remote_addr().to_string(),
                listen_addr: p.info().listen_addr.clone(),
                outbound: p.is_outbound(),
                connected_secs: status.duration_secs,
                bytes_sent: status.bytes_sent,
                bytes_received: status.bytes_received,
            }
        })
        .collect();
    Json(peers)
}

async fn metrics_route(State(state): State<AppState>) -> impl IntoResponse {
    let (outbound, inbound, _) = state.switch.num_peers();
    state.metrics.observe_peers(outbound, inbound);
    state.metrics.observe_mempool(&state.mempool.stats());
    metrics::metrics_handler(State(state.metrics)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use linkmesh_protocol::config::{DEFAULT_NETWORK, PROTOCOL_VERSION};
    use linkmesh_protocol::crypto::NodeKey;
    use linkmesh_protocol::mempool::{Address, App, MemoryApp, MempoolConfig};
    use linkmesh_protocol::p2p::{NodeInfo, P2pConfig};
    use tower::ServiceExt;

    /// State over a stopped switch and an empty pool.
    fn test_app_state() -> (AppState, Arc<MemoryApp>) {
        let key = NodeKey::generate();
        let info = NodeInfo {
            pub_key: key.public_key(),
            network: DEFAULT_NETWORK.into(),
            version: PROTOCOL_VERSION.into(),
            channels: Vec::new(),
            moniker: "api-test".into(),
            role: NodeRole::Peer,
            listen_addr: String::new(),
            local_addrs: Vec::new(),
        };
        let switch = Switch::new(key, P2pConfig::default(), info).unwrap();
        let app = Arc::new(MemoryApp::new());
        let mempool = Mempool::new(MempoolConfig::default(), app.clone() as Arc<dyn App<Transaction>>);
        let state = AppState {
            version: "0.1.0-test".into(),
            network: DEFAULT_NETWORK.into(),
            switch,
            mempool,
            metrics: Arc::new(crate::metrics::NodeMetrics::new().unwrap()),
        };
        (state, app)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (state, _) = test_app_state();
        let (status, body) = get(&create_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_pool_contents() {
        let (state, app) = test_app_state();
        let key = NodeKey::from_seed(&[5; 32]);
        app.set_balance(Address::from_public_key(&key.public_key()), 100);
        state
            .mempool
            .add_tx(None, Transaction::transfer(0, Address([1; 20]), 1).sign(&key))
            .unwrap();
        let node_id = state.switch.node_id().to_string();

        let (status, body) = get(&create_router(state), "/status").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["node_id"], node_id);
        assert_eq!(v["network"], DEFAULT_NETWORK);
        assert_eq!(v["moniker"], "api-test");
        assert_eq!(v["peers"]["outbound"], 0);
        assert_eq!(v["mempool"]["pending"], 1);
    }

    #[tokio::test]
    async fn peers_empty_without_connections() {
        let (state, _) = test_app_state();
        let (status, body) = get(&create_router(state), "/peers").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v, serde_json::json!([]));
    }

    #[tokio::test]
    async fn metrics_endpoint_is_text() {
        let (state, _) = test_app_state();
        let (status, body) = get(&create_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("linkmesh_mempool_pending 0"));
    }
}
