//! # CLI Interface
//!
//! Command-line arguments for `linkmesh-node`, built with `clap` derive.
//! Flags override the matching keys of the TOML config file; every flag can
//! also be set through its `LINKMESH_*` environment variable.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use linkmesh_protocol::config::DEFAULT_API_PORT;

/// LinkMesh peer node.
///
/// Joins the overlay, gossips transactions and serves a small status API.
#[derive(Parser, Debug)]
#[command(
    name = "linkmesh-node",
    about = "LinkMesh peer node",
    version,
    propagate_version = true
)]
pub struct LinkMeshCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory, a node key and a default config file.
    Init(InitArgs),
    /// Query the status endpoint of a running node.
    Status(StatusArgs),
}

/// Log output format.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Node configuration file (TOML). Defaults to `<data-dir>/config.toml`
    /// when that file exists.
    #[arg(long, short = 'c', env = "LINKMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the node key and the peer database.
    #[arg(long, short = 'd', env = "LINKMESH_DATA_DIR", default_value = ".linkmesh")]
    pub data_dir: PathBuf,

    /// TCP port for peer connections. UDP discovery binds the same port.
    #[arg(long, env = "LINKMESH_P2P_PORT")]
    pub p2p_port: Option<u16>,

    /// Port for the status and metrics API.
    #[arg(long, env = "LINKMESH_API_PORT")]
    pub api_port: Option<u16>,

    /// Comma separated bootnode URLs.
    #[arg(long, env = "LINKMESH_BOOTNODES")]
    pub bootnodes: Option<String>,

    #[arg(long, value_enum, env = "LINKMESH_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "LINKMESH_DATA_DIR", default_value = ".linkmesh")]
    pub data_dir: PathBuf,

    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Base URL of the node's API.
    #[arg(long, default_value_t = format!("http://127.0.0.1:{DEFAULT_API_PORT}"))]
    pub api_url: String,

    /// Also list connected peers.
    #[arg(long)]
    pub peers: bool,
}
