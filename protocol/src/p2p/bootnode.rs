//! # Bootnode Client
//!
//! Privileged nodes learn their seed list and their own role from a bootnode
//! HTTP service. The request is authenticated by signing
//! `md5("time=<unix>")` with the node key:
//!
//! ```text
//! POST {bootnode}/api/bootnode
//! {"time": 1700000000, "sign": "<hex sig>", "pubkey": "0x<hex pubkey>"}
//!
//! {"code": 0, "message": "", "type": 5,
//!  "nodes": [{"id": "0x..", "endpoint": {"ip": ["1.2.3.4"], "port": {"udp": 1, "tcp": 2}}}]}
//! ```
//!
//! A node entry with several IPs expands into one [`Node`] per IP. When the
//! configured boot source is a filesystem path instead of a URL, the same
//! JSON document is read from disk.
//!
//! Failed requests rotate to the next bootnode of the [`NodeProfile`] until
//! every bootnode has been tried once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::node::{Endpoint, Node, NodeId};
use super::profile::{NodeProfile, NodeRole};
use crate::crypto::{md5_digest, NodeKey, PublicKey};

const ROUTE_GET_SEEDS: &str = "api/bootnode";
const ROUTE_GET_HEIGHT: &str = "api/height";
const SUCCESS: i32 = 0;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BootnodeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bootnode returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("bootnode returned code {code}: {message}")]
    Rejected { code: i32, message: String },

    #[error("malformed bootnode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("seed file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("no bootnode configured")]
    NoBootnode,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedsRequest {
    pub time: i64,
    pub sign: String,
    pub pubkey: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedEndpoint {
    #[serde(default)]
    pub ip: Vec<String>,
    /// Keyed by `"udp"`, `"tcp"` and optionally `"http"`.
    #[serde(default)]
    pub port: HashMap<String, u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SeedEndpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedsResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub role: i32,
    #[serde(rename = "nodes", default)]
    pub seeds: Vec<SeedEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeightResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub height: u64,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn seed_id(entry: &SeedEntry) -> Option<NodeId> {
    if let Some(id) = entry.id.as_deref() {
        return NodeId::from_hex(id).ok();
    }
    entry
        .pubkey
        .as_deref()
        .and_then(|pk| PublicKey::from_hex(pk).ok())
        .map(|pk| pk.node_id())
}

/// Expands bootnode entries into nodes, one per advertised IP.
///
/// Entries without an id, an endpoint or a parseable IP are skipped.
pub fn expand_seeds(seeds: &[SeedEntry]) -> Vec<Node> {
    let mut nodes = Vec::new();
    for entry in seeds {
        let (Some(id), Some(endpoint)) = (seed_id(entry), entry.endpoint.as_ref()) else {
            debug!(?entry, "skipping incomplete seed entry");
            continue;
        };
        let udp = endpoint.port.get("udp").copied().unwrap_or(0);
        let tcp = endpoint.port.get("tcp").copied().unwrap_or(0);
        for raw in &endpoint.ip {
            match raw.parse::<IpAddr>() {
                Ok(ip) => nodes.push(Node::new(id, Endpoint::new(ip, udp, tcp))),
                Err(_) => debug!(ip = %raw, "skipping unparseable seed ip"),
            }
        }
    }
    nodes
}

/// Decodes a seeds document and checks its result code.
pub fn parse_seeds_response(body: &[u8]) -> Result<(Vec<Node>, NodeRole), BootnodeError> {
    let resp: SeedsResponse = serde_json::from_slice(body)?;
    if resp.code != SUCCESS {
        return Err(BootnodeError::Rejected {
            code: resp.code,
            message: resp.message,
        });
    }
    let role = NodeRole::from_code(resp.role).unwrap_or_default();
    Ok((expand_seeds(&resp.seeds), role))
}

/// Builds the signed request body for `key` at `time` (unix seconds).
pub fn build_seeds_request(key: &NodeKey, time: i64) -> SeedsRequest {
    let digest = md5_digest(format!("time={time}").as_bytes());
    SeedsRequest {
        time,
        sign: key.sign(&digest).to_hex(),
        pubkey: format!("0x{}", key.public_key().to_hex()),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// SeedSource
// ---------------------------------------------------------------------------

/// Where seeds and the canonical chain height come from.
///
/// The HTTP client below is the production implementation; tests plug in
/// fixed lists.
#[async_trait]
pub trait SeedSource: Send + Sync {
    /// Fetch the current seed list and our assigned role.
    async fn get_seeds(&self) -> Result<(Vec<Node>, NodeRole), BootnodeError>;

    /// Fetch the chain height as seen by the bootnode.
    async fn current_height(&self) -> Result<u64, BootnodeError>;
}

/// HTTP (or file) backed [`SeedSource`].
pub struct BootnodeClient {
    http: reqwest::Client,
    key: NodeKey,
    profile: Arc<NodeProfile>,
    /// A local seed file takes precedence over the bootnode list when set.
    seed_file: Option<String>,
}

impl BootnodeClient {
    pub fn new(key: NodeKey, profile: Arc<NodeProfile>) -> Result<Self, BootnodeError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            key,
            profile,
            seed_file: None,
        })
    }

    /// Read seeds from a JSON file instead of asking a bootnode.
    pub fn with_seed_file(mut self, path: impl Into<String>) -> Self {
        self.seed_file = Some(path.into());
        self
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Vec<u8>, BootnodeError> {
        let resp = self.http.post(url).json(body).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(BootnodeError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes.to_vec())
    }

    /// Posts to `route` on successive bootnodes until one answers.
    async fn post_rotating<T: Serialize + ?Sized>(
        &self,
        route: &str,
        body: &T,
    ) -> Result<Vec<u8>, BootnodeError> {
        let attempts = self.profile.bootnode_count().max(1);
        let mut last_err = BootnodeError::NoBootnode;
        for retry in 0..attempts {
            let Some(base) = self.profile.next_bootnode() else {
                return Err(BootnodeError::NoBootnode);
            };
            let url = format!("{}/{}", base.trim_end_matches('/'), route);
            match self.post(&url, body).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!(retry, url = %url, error = %e, "bootnode request failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn read_seed_file(path: &str) -> Result<(Vec<Node>, NodeRole), BootnodeError> {
        let data = std::fs::read(path).map_err(|source| BootnodeError::File {
            path: path.to_string(),
            source,
        })?;
        parse_seeds_response(&data)
    }
}

#[async_trait]
impl SeedSource for BootnodeClient {
    async fn get_seeds(&self) -> Result<(Vec<Node>, NodeRole), BootnodeError> {
        let (nodes, role) = match &self.seed_file {
            Some(path) => Self::read_seed_file(path)?,
            None => {
                let req = build_seeds_request(&self.key, unix_now());
                let body = self.post_rotating(ROUTE_GET_SEEDS, &req).await?;
                parse_seeds_response(&body)?
            }
        };
        self.profile.set_role(role);
        debug!(seeds = nodes.len(), %role, "fetched seeds");
        Ok((nodes, role))
    }

    async fn current_height(&self) -> Result<u64, BootnodeError> {
        let body = self.post_rotating(ROUTE_GET_HEIGHT, "").await?;
        let resp: HeightResponse = serde_json::from_slice(&body)?;
        if resp.code != SUCCESS {
            return Err(BootnodeError::Rejected {
                code: resp.code,
                message: resp.message,
            });
        }
        Ok(resp.height)
    }
}
