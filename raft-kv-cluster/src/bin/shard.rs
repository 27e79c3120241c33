//! Runs one node of the replicated key-value store.
//!
//! # Example usage
//!
//! Start a 3-node group on one machine:
//! ```bash
//! # Terminal 1: bootstraps the group
//! cargo run --bin shard -- --member-id 1 \
//!   --http-addr 127.0.0.1:8011 --raft-addr 127.0.0.1:18011 \
//!   --peer-shard 2=127.0.0.1:8021,3=127.0.0.1:8031
//!
//! # Terminal 2
//! cargo run --bin shard -- --member-id 2 \
//!   --http-addr 127.0.0.1:8021 --raft-addr 127.0.0.1:18021 \
//!   --peer-shard 1=127.0.0.1:8011,3=127.0.0.1:8031 --join 127.0.0.1:8011
//!
//! # Terminal 3
//! cargo run --bin shard -- --member-id 3 \
//!   --http-addr 127.0.0.1:8031 --raft-addr 127.0.0.1:18031 \
//!   --peer-shard 1=127.0.0.1:8011,2=127.0.0.1:8021 --join 127.0.0.1:8011
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use raft_kv_cluster::config::{NodeArgs, NodeConfig};
use raft_kv_cluster::init_tracing;
use raft_kv_cluster::server::start_node;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = NodeConfig::try_from(NodeArgs::parse())?;
    let mut node = start_node(config).await?;
    info!(http = %node.http_addr, raft = %node.raft_addr(), "node started");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            signal.map_err(anyhow::Error::from)
        }
        served = node.wait() => {
            if let Err(err) = &served {
                warn!("http server exited with error: {err:?}");
            }
            served
        }
    };
    node.shutdown();
    outcome
}
