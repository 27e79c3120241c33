//! Runs the leader-aware router in front of the nodes.
//!
//! ```bash
//! cargo run --bin router -- --listen 127.0.0.1:8000 \
//!   --node 127.0.0.1:8011,127.0.0.1:8021,127.0.0.1:8031
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use raft_kv_cluster::config::{RouterArgs, RouterConfig};
use raft_kv_cluster::init_tracing;
use raft_kv_cluster::router;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = RouterConfig::from(RouterArgs::parse());
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("ctrl-c received, shutting down");
        }
        result = router::serve(config) => {
            if let Err(err) = &result {
                warn!("router exited with error: {err:?}");
            }
            return result;
        }
    }
    Ok(())
}
