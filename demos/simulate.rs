//! An example which simulates a small Paxos cluster locally (on one machine).
//!
//! Run this example as follows
//!     RUST_LOG=paxos_node=info cargo run --example simulate

use std::time::Duration;

use log::info;

use paxos_node::configurations::NodeConfig;
use paxos_node::node::Node;
use paxos_node::message::NodeLocation;

const NUM_NODES: u64 = 3;

#[tokio::main]
async fn main() {
    env_logger::init();

    let dir = std::env::temp_dir().join(format!("paxos-simulate-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("failed to create stable storage directory");

    let peers: Vec<NodeLocation> = (0..NUM_NODES).map(|num| NodeLocation::new("127.0.0.1", 9000 + num as u16, num)).collect();

    let mut nodes = Vec::new();
    for num in 0..NUM_NODES {
        let node = Node::start(peers[num as usize].clone(), peers.clone(), &dir, NodeConfig::default())
            .await
            .expect("failed to start node");
        nodes.push(node);
    }
    info!("started a {}-node cluster under {:?}", NUM_NODES, dir);

    let csn = nodes[0].submit("hello from node 0").await.expect("submit failed");
    info!("node 0 submitted a value for csn {}", csn);

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let decided = nodes[1].get_decided_values().await.expect("node actor gone");
        if let Some(value) = decided.get(&csn) {
            info!("node 1 learned csn {} = {:?}", csn, value);
            break;
        }
    }

    for node in nodes {
        node.stop().await;
    }

    let _ = std::fs::remove_dir_all(&dir);
}
