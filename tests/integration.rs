// tests/integration.rs
//
// End-to-end scenarios over real UDP sockets on loopback, following the
// teacher's `tests/integration_p2p.rs` style (multi-threaded tokio runtime,
// nodes bound to `127.0.0.1:0` and joined against each other directly
// rather than through a simulated network).

use kadcoin::config::NodeConfig;
use kadcoin::node::Node;
use std::sync::Arc;
use std::time::Duration;

fn config() -> NodeConfig {
    NodeConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        request_timeout_ms: 500,
        ..NodeConfig::default()
    }
}

async fn spawn_node() -> Arc<Node> {
    let node = Node::bind(config()).await.expect("bind node");
    node.run();
    node
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_lookup_fails() {
    let a = spawn_node().await;
    let result = a.get(b"x").await;
    assert!(result.is_err(), "get on an isolated node must fail");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_node_put_get_round_trips() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    b.join(a.local_addr()).await.expect("b joins a");

    let acked = a.put(b"hello", b"world".to_vec()).await.expect("put succeeds");
    assert!(acked >= 1);

    let value = b.get(b"hello").await.expect("get succeeds");
    assert_eq!(value, b"world");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_two_phase_commit_happy_path() {
    let a = spawn_node().await; // sender, also bootstrapper
    let b = spawn_node().await; // receiver
    let c = spawn_node().await; // witness

    b.join(a.local_addr()).await.expect("b joins a");
    c.join(a.local_addr()).await.expect("c joins a");
    // give b's and c's ledger-adoption broadcasts a moment to land on a
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = a.send_bitcoins(b.id, c.id, 30).await;
    assert_eq!(result, "committed");

    assert_eq!(a.balance(), 70);
    assert!(!a.is_busy());
    assert!(!b.is_busy());
    assert!(!c.is_busy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_with_insufficient_balance_is_rejected() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    b.join(a.local_addr()).await.unwrap();
    c.join(a.local_addr()).await.unwrap();

    let result = a.send_bitcoins(b.id, c.id, 1_000_000).await;
    assert_eq!(result, "Not enough balance");
    assert_eq!(a.balance(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_signature_is_rejected_by_commit() {
    use kadcoin::ledger::Ledger;

    let owner = kadcoin::id::NodeId::random();
    let receiver = kadcoin::id::NodeId::random();
    let witness = kadcoin::id::NodeId::random();
    let ledger = Ledger::new_with_genesis(owner, 100);
    let (payment, refund) = ledger.gen_trans(owner, receiver, witness, 10).unwrap();
    let txs = vec![payment, refund.unwrap()];

    let wrong_keypair = kadcoin::crypto::Keypair::generate();
    let canonical = bincode::serialize(&txs).unwrap();
    let bad_signature = wrong_keypair.sign(&canonical);
    // a signature from the wrong key must not verify against what a
    // commit_tx call would claim is the sender's public key.
    let claimed_sender_keypair = kadcoin::crypto::Keypair::generate();
    assert!(!kadcoin::crypto::verify(
        &claimed_sender_keypair.public(),
        &canonical,
        &bad_signature
    ));
}
