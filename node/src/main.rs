// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # LinkMesh Node
//!
//! Entry point for the `linkmesh-node` binary. Loads the config, joins the
//! overlay, runs the mempool reactor and serves the status API.
//!
//! - `run`   : start the node
//! - `init`  : create the data directory, node key and config file
//! - `status`: query a running node's status endpoint

mod api;
mod cli;
mod config;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use linkmesh_protocol::config::{PROTOCOL_VERSION, STATS_REPORT_INTERVAL};
use linkmesh_protocol::crypto::NodeKey;
use linkmesh_protocol::mempool::{App, MemoryApp, Mempool, MempoolReactor, Transaction};
use linkmesh_protocol::p2p::profile::parse_bootnode_list;
use linkmesh_protocol::p2p::{
    BootnodeClient, ConManager, DefaultTableFactory, NodeInfo, NodeProfile, NodeRole, PeerDb,
    SeedSource, Switch, TableFactory,
};
use linkmesh_protocol::sync::{HeightSource, SyncHeightManager};

use cli::{Commands, LinkMeshCli, LogFormat};
use config::NodeConfig;
use metrics::NodeMetrics;

const KEY_FILE: &str = "node.key";
const CONFIG_FILE: &str = "config.toml";
const PEER_DB_DIR: &str = "peers";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = LinkMeshCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
    }
}

/// The pool height doubles as the chain height: consensus reports every
/// committed block through `Mempool::update`.
struct PoolHeight(Arc<Mempool<Transaction>>);

impl HeightSource for PoolHeight {
    fn height(&self) -> u64 {
        self.0.height()
    }
}

fn load_config(args: &cli::RunArgs) -> Result<NodeConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| args.data_dir.join(CONFIG_FILE));
    let mut config = if path.exists() {
        NodeConfig::load(&path)?
    } else if args.config.is_some() {
        anyhow::bail!("config file {} not found", path.display());
    } else {
        NodeConfig::default()
    };
    if let Some(port) = args.p2p_port {
        config.set_p2p_port(port)?;
    }
    if let Some(port) = args.api_port {
        config.set_api_port(port)?;
    }
    if let Some(list) = &args.bootnodes {
        config.bootnodes = parse_bootnode_list(list);
    }
    Ok(config)
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);
    let config = load_config(&args)?;

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data directory {}", args.data_dir.display()))?;
    let key = NodeKey::load_or_generate(&args.data_dir.join(KEY_FILE))
        .context("failed to load node key")?;

    tracing::info!(
        node = %key.node_id(),
        network = %config.network,
        listen = %config.p2p.listen_address,
        api = %config.api_address,
        "starting linkmesh-node"
    );

    // --- Overlay ---
    let profile = Arc::new(NodeProfile::new(NodeRole::Peer, config.bootnodes.clone()));
    let mut client = BootnodeClient::new(key.clone(), profile.clone())
        .context("failed to build bootnode client")?;
    if let Some(path) = &config.seed_file {
        client = client.with_seed_file(path.clone());
    }
    let source: Arc<dyn SeedSource> = Arc::new(client);

    let info = NodeInfo {
        pub_key: key.public_key(),
        network: config.network.clone(),
        version: PROTOCOL_VERSION.into(),
        channels: Vec::new(),
        moniker: config.moniker.clone(),
        role: profile.role(),
        listen_addr: String::new(),
        local_addrs: Vec::new(),
    };
    let switch = Switch::new(key.clone(), config.p2p.clone(), info).context("invalid p2p config")?;

    // --- Mempool ---
    let app = Arc::new(MemoryApp::new());
    let mempool = Mempool::new(config.mempool.clone(), app as Arc<dyn App<Transaction>>);
    switch.add_reactor(MempoolReactor::new(mempool.clone(), Arc::downgrade(&switch)));

    // --- Discovery ---
    let tcp_addr = switch.listen().await.context("failed to bind p2p listener")?;
    let db_path = args.data_dir.join(PEER_DB_DIR);
    let db = Arc::new(
        PeerDb::open(&db_path)
            .with_context(|| format!("failed to open peer database at {}", db_path.display()))?,
    );
    let factory = Arc::new(DefaultTableFactory {
        key: key.clone(),
        udp_addr: tcp_addr,
        tcp_port: tcp_addr.port(),
        db,
        max_dial_out: config.p2p.max_outbound,
        source: source.clone(),
    });

    let (seeds, role) = match source.get_seeds().await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(error = %e, "bootnode unavailable, using static seeds");
            (config.p2p.seed_nodes(), NodeRole::Peer)
        }
    };
    let table = factory
        .build(role, seeds)
        .await
        .context("failed to build discovery table")?;
    profile.set_role(role);
    switch.set_local_role(role);
    switch.set_table(Some(table));

    switch.start().await.context("failed to start switch")?;
    mempool.start();

    let con_manager = ConManager::new(switch.clone(), profile.clone(), source.clone(), factory);
    con_manager.start();

    let sync = config.sync.enabled.then(|| {
        let manager = SyncHeightManager::new(
            &config.sync,
            con_manager.clone(),
            source.clone(),
            Arc::new(PoolHeight(mempool.clone())),
        );
        manager.start();
        manager
    });

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let sampler = {
        let metrics = node_metrics.clone();
        let switch = switch.clone();
        let mempool = mempool.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATS_REPORT_INTERVAL);
            loop {
                tick.tick().await;
                let (outbound, inbound, _) = switch.num_peers();
                metrics.observe_peers(outbound, inbound);
                metrics.observe_mempool(&mempool.stats());
            }
        })
    };

    // --- API server ---
    let router = api::create_router(api::AppState {
        version: format!("{} (protocol {PROTOCOL_VERSION})", env!("CARGO_PKG_VERSION")),
        network: config.network.clone(),
        switch: switch.clone(),
        mempool: mempool.clone(),
        metrics: node_metrics,
    });
    let listener = tokio::net::TcpListener::bind(&config.api_address)
        .await
        .with_context(|| format!("failed to bind API listener on {}", config.api_address))?;
    tracing::info!(addr = %config.api_address, "status API listening");

    tokio::select! {
        res = axum::serve(listener, router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    sampler.abort();
    if let Some(sync) = sync {
        sync.stop();
    }
    con_manager.stop().await;
    mempool.stop();
    switch.stop().await;
    tracing::info!("linkmesh-node stopped");
    Ok(())
}

fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("linkmesh_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let key = NodeKey::load_or_generate(&data_dir.join(KEY_FILE)).context("failed to create node key")?;

    let config_path = data_dir.join(CONFIG_FILE);
    if config_path.exists() && !args.force {
        tracing::info!(path = %config_path.display(), "config exists, keeping it");
    } else {
        NodeConfig::default().save(&config_path)?;
    }

    println!("Node initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Node id        : {}", key.node_id());
    Ok(())
}

async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let base = args.api_url.trim_end_matches('/');
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build http client")?;

    let mut paths = vec!["status"];
    if args.peers {
        paths.push("peers");
    }
    for path in paths {
        let url = format!("{base}/{path}");
        let body: serde_json::Value = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("malformed response from {url}"))?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
