//! Transactions travelling between two pools over the mempool channel.

use std::sync::Arc;
use std::time::Duration;

use linkmesh_protocol::config::{DEFAULT_NETWORK, PROTOCOL_VERSION};
use linkmesh_protocol::crypto::NodeKey;
use linkmesh_protocol::mempool::{
    Address, App, MemoryApp, Mempool, MempoolConfig, MempoolReactor, Transaction, Tx,
};
use linkmesh_protocol::p2p::{NodeInfo, NodeRole, P2pConfig, Switch};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Node {
    switch: Arc<Switch>,
    app: Arc<MemoryApp>,
    pool: Arc<Mempool<Transaction>>,
}

async fn node(moniker: &str, receive: bool) -> Node {
    let key = NodeKey::generate();
    let info = NodeInfo {
        pub_key: key.public_key(),
        network: DEFAULT_NETWORK.into(),
        version: PROTOCOL_VERSION.into(),
        channels: Vec::new(),
        moniker: moniker.into(),
        role: NodeRole::Peer,
        listen_addr: String::new(),
        local_addrs: Vec::new(),
    };
    let config = P2pConfig {
        listen_address: "127.0.0.1:0".into(),
        ..P2pConfig::default()
    };
    let switch = Switch::new(key, config, info).unwrap();

    let app = Arc::new(MemoryApp::new());
    let pool_config = MempoolConfig {
        receive_p2p_tx: receive,
        ..MempoolConfig::default()
    };
    let pool = Mempool::new(pool_config, app.clone() as Arc<dyn App<Transaction>>);
    switch.add_reactor(MempoolReactor::new(pool.clone(), Arc::downgrade(&switch)));
    switch.start().await.unwrap();
    Node { switch, app, pool }
}

async fn connect(a: &Node, b: &Node) {
    let addr = b.switch.local_addr().unwrap();
    a.switch
        .dial_peer_with_address(addr, Some(b.switch.node_id()))
        .await
        .unwrap();
}

fn funded_sender(nodes: &[&Node], seed: u8) -> NodeKey {
    let key = NodeKey::from_seed(&[seed; 32]);
    let addr = Address::from_public_key(&key.public_key());
    for n in nodes {
        n.app.set_balance(addr, 1_000);
    }
    key
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_tx_reaches_the_peer() {
    let a = node("a", true).await;
    let b = node("b", true).await;
    let key = funded_sender(&[&a, &b], 1);
    connect(&a, &b).await;

    let tx = Transaction::transfer(0, Address([9; 20]), 5).sign(&key);
    let hash = tx.hash();
    a.pool.add_tx(None, tx).unwrap();

    assert!(eventually(|| b.pool.has_tx(&hash)).await);
    assert_eq!(b.pool.size(), 1);

    a.switch.stop().await;
    b.switch.stop().await;
}

#[tokio::test]
async fn existing_pool_is_announced_on_connect() {
    let a = node("a", true).await;
    let b = node("b", true).await;
    let key = funded_sender(&[&a, &b], 2);

    let txs: Vec<Transaction> = (0..3)
        .map(|n| Transaction::transfer(n, Address([9; 20]), 1).sign(&key))
        .collect();
    for tx in &txs {
        a.pool.add_tx(None, tx.clone()).unwrap();
    }

    connect(&a, &b).await;
    assert!(eventually(|| txs.iter().all(|tx| b.pool.has_tx(&tx.hash()))).await);
    assert_eq!(b.pool.size(), 3);

    a.switch.stop().await;
    b.switch.stop().await;
}

#[tokio::test]
async fn peer_not_receiving_stays_empty() {
    let a = node("a", true).await;
    let b = node("b", false).await;
    let key = funded_sender(&[&a, &b], 3);
    connect(&a, &b).await;

    let tx = Transaction::transfer(0, Address([9; 20]), 5).sign(&key);
    a.pool.add_tx(None, tx).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(b.pool.size(), 0);

    a.switch.stop().await;
    b.switch.stop().await;
}
