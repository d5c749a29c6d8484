//! Node configuration file.
//!
//! ```toml
//! network = "linkmesh-devnet"
//! moniker = "edge-1"
//! bootnodes = ["https://boot.example.org:8443"]
//!
//! [p2p]
//! listen_address = "0.0.0.0:13500"
//!
//! [mempool]
//! size = 3000
//! receive_p2p_tx = true
//!
//! [sync]
//! check_interval_secs = 30
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use linkmesh_protocol::config::{DEFAULT_API_PORT, DEFAULT_NETWORK};
use linkmesh_protocol::mempool::MempoolConfig;
use linkmesh_protocol::p2p::P2pConfig;
use linkmesh_protocol::sync::SyncConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: String,
    pub moniker: String,
    pub bootnodes: Vec<String>,
    /// JSON seed document read instead of asking a bootnode.
    pub seed_file: Option<String>,
    pub api_address: String,
    pub p2p: P2pConfig,
    pub mempool: MempoolConfig,
    pub sync: SyncConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.into(),
            moniker: "linkmesh-node".into(),
            bootnodes: Vec::new(),
            seed_file: None,
            api_address: format!("0.0.0.0:{DEFAULT_API_PORT}"),
            p2p: P2pConfig::default(),
            mempool: MempoolConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self).context("failed to encode config")?;
        std::fs::write(path, raw).with_context(|| format!("failed to write config {}", path.display()))
    }

    /// Keeps the host of the listen address and swaps the port.
    pub fn set_p2p_port(&mut self, port: u16) -> Result<()> {
        self.p2p.listen_address = with_port(&self.p2p.listen_address, port)?;
        Ok(())
    }

    pub fn set_api_port(&mut self, port: u16) -> Result<()> {
        self.api_address = with_port(&self.api_address, port)?;
        Ok(())
    }
}

fn with_port(addr: &str, port: u16) -> Result<String> {
    let mut parsed: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid address {addr}"))?;
    parsed.set_port(port);
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            moniker = "edge-1"
            bootnodes = ["https://boot:1"]

            [mempool]
            receive_p2p_tx = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.moniker, "edge-1");
        assert_eq!(cfg.network, DEFAULT_NETWORK);
        assert!(cfg.mempool.receive_p2p_tx);
        assert_eq!(cfg.mempool.size, MempoolConfig::default().size);
        assert_eq!(cfg.p2p.max_num_peers, P2pConfig::default().max_num_peers);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = NodeConfig::default();
        cfg.moniker = "saved".into();
        cfg.save(&path).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap().moniker, "saved");
    }

    #[test]
    fn port_override_keeps_host() {
        let mut cfg = NodeConfig::default();
        cfg.p2p.listen_address = "127.0.0.1:1".into();
        cfg.set_p2p_port(14000).unwrap();
        assert_eq!(cfg.p2p.listen_address, "127.0.0.1:14000");
        assert!(cfg.set_api_port(1).is_ok());
        assert!(with_port("nonsense", 1).is_err());
    }
}
