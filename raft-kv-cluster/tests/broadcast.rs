//! Leader announcements between nodes.
//!
//! Most nodes here bootstrap their own single-member group, so each one is
//! the leader of its shard and announces itself to the peers it knows. The
//! failover test runs one joined group whose members know each other as peers.

use std::time::Duration;

use anyhow::{Result, anyhow};
use reqwest::StatusCode;
use serde_json::{Value, json};

use raft_kv_cluster::config::NodeConfig;
use raft_kv_cluster::protocol::JoinRequest;
use raft_kv_cluster::server::{RunningNode, start_node};

async fn solo_shard(id: u64, peers: Vec<(u64, String)>) -> Result<RunningNode> {
    let mut config = NodeConfig::local(id);
    config.bootstrap_member = id;
    config.peer_shards = peers;
    start_node(config).await
}

async fn known_peers(http: &reqwest::Client, node: &RunningNode) -> Result<Value> {
    let body: Value = http
        .get(format!("http://{}/peers", node.http_addr))
        .send()
        .await?
        .json()
        .await?;
    Ok(body["data"].clone())
}

/// Waits until `node` lists `shard` at `address`.
async fn wait_for_peer(
    http: &reqwest::Client,
    node: &RunningNode,
    shard: u64,
    address: &str,
) -> Result<Value> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let peers = known_peers(http, node).await?;
        let entry = &peers[shard.to_string()];
        if entry["address"] == address {
            return Ok(entry.clone());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("shard {shard} never reached {}: {peers}", node.http_addr));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_leaders_announce_and_peers_relay() -> Result<()> {
    let http = reqwest::Client::new();
    let first = solo_shard(1, Vec::new()).await?;
    let second = solo_shard(2, vec![(1, first.http_addr.clone())]).await?;

    let entry = wait_for_peer(&http, &first, 2, &second.http_addr).await?;
    assert!(entry["term"].as_u64().unwrap() >= 1);

    // The third node only knows the first; the first relays to the second.
    let third = solo_shard(3, vec![(1, first.http_addr.clone())]).await?;
    wait_for_peer(&http, &first, 3, &third.http_addr).await?;
    wait_for_peer(&http, &second, 3, &third.http_addr).await?;

    for node in [&first, &second, &third] {
        node.shutdown();
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_shard_is_idempotent() -> Result<()> {
    let http = reqwest::Client::new();
    let node = solo_shard(1, Vec::new()).await?;
    let url = format!("http://{}/addshard", node.http_addr);
    let announcement = json!({ "shardID": "7", "shardAddress": "127.0.0.1:1" });

    let resp = http.post(&url).json(&announcement).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["message"], "Shard added successfully");
    assert_eq!(body["data"]["changed"], true);

    let body: Value = http.post(&url).json(&announcement).send().await?.json().await?;
    assert_eq!(body["data"]["changed"], false);

    let peers = known_peers(&http, &node).await?;
    assert_eq!(peers["7"]["address"], "127.0.0.1:1");

    let resp = http
        .post(&url)
        .json(&json!({ "shardID": "seven", "address": "127.0.0.1:1" }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    node.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_announcements_do_not_overwrite() -> Result<()> {
    let http = reqwest::Client::new();
    let node = solo_shard(1, Vec::new()).await?;
    let url = format!("http://{}/newleader", node.http_addr);

    let body: Value = http
        .post(&url)
        .json(&json!({ "shardID": 5, "address": "127.0.0.1:2", "term": 4 }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["message"], "Leader information updated successfully");
    assert_eq!(body["data"]["changed"], true);

    let body: Value = http
        .post(&url)
        .json(&json!({ "shardID": 5, "address": "127.0.0.1:3", "term": 3 }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["data"]["changed"], false);
    assert_eq!(body["data"]["address"], "127.0.0.1:2");
    assert_eq!(body["data"]["term"], 4);

    node.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failover_is_announced_to_surviving_peers() -> Result<()> {
    let http = reqwest::Client::new();
    let mut nodes = Vec::new();
    for id in 1..=3 {
        nodes.push(start_node(NodeConfig::local(id)).await?);
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !nodes[0].consensus.is_leader() {
        assert!(tokio::time::Instant::now() < deadline, "node 1 never became leader");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for node in &nodes[1..] {
        let request = JoinRequest {
            member_id: node.consensus.id(),
            address: node.raft_addr().to_string(),
            http_address: Some(node.http_addr.clone()),
            shard_id: None,
        };
        let resp = http
            .post(format!("http://{}/raft/join", nodes[0].http_addr))
            .json(&request)
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // Every member learns the others' shards at term 0.
    for node in &nodes {
        for other in nodes.iter().filter(|o| o.consensus.id() != node.consensus.id()) {
            let resp = http
                .post(format!("http://{}/addshard", node.http_addr))
                .json(&json!({ "shardID": other.consensus.shard_id(), "address": other.http_addr }))
                .send()
                .await?;
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    let old_term = nodes[0].consensus.leadership().term;
    nodes[0].shutdown();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let (winner, survivor) = loop {
        if nodes[1].consensus.is_leader() {
            break (&nodes[1], &nodes[2]);
        }
        if nodes[2].consensus.is_leader() {
            break (&nodes[2], &nodes[1]);
        }
        assert!(tokio::time::Instant::now() < deadline, "no new leader after failover");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let shard = winner.consensus.shard_id();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let entry = loop {
        let peers = known_peers(&http, survivor).await?;
        let entry = peers[shard.to_string()].clone();
        if entry["term"].as_u64().unwrap_or_default() > old_term {
            break entry;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("shard {shard} never announced a newer term: {peers}"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(entry["address"], winner.http_addr);

    for node in &nodes[1..] {
        node.shutdown();
    }
    Ok(())
}
