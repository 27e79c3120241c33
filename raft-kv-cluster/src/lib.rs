//! Raft-replicated key-value store with a leader-aware router.
//!
//! Every node hosts one member of a single Raft group and an in-memory
//! key-value state machine, optionally backed by a store directory so a
//! restarted member resumes where it stopped. Writes and reads are both replicated through the
//! log, so they are ordered the same way on every member. A router process
//! sits in front of the nodes, discovers the leader and retries on
//! leadership changes.
//!
//! # Architecture
//!
//! - **Worker thread**: Drives the Raft state machine (one per node)
//! - **Transport threads**: Listener plus one sender thread per peer
//! - **Tokio runtime**: HTTP handlers, leader observer, broadcasts
//!
//! Handlers reach the worker through crossbeam channels and await answers on
//! tokio oneshot channels under a timeout.
//!
//! # Modules
//!
//! - [`node`]: Core Raft node wrapping tikv/raft library
//! - [`runtime`]: Worker loop, consensus handle, leadership subscription
//! - [`transport`]: Length-prefixed TCP transport for Raft messages
//! - [`storage`]: Raft log storage with state-carrying snapshots
//! - [`disk`]: Durable copy of the log, hard state and snapshot
//! - [`fsm`]: Replicated key-value state machine
//! - [`membership`]: Join states and member directory
//! - [`command`]: Payloads replicated through the Raft log
//! - [`peers`] / [`broadcast`]: Known-peers map and leader announcements
//! - [`server`]: Node HTTP API
//! - [`router`]: Leader discovery and request routing
//! - [`client`], [`protocol`]: HTTP client and wire types
//! - [`config`]: Command-line configuration
//! - [`error`]: Error taxonomy

pub mod broadcast;
pub mod client;
pub mod command;
pub mod config;
pub mod disk;
pub mod error;
pub mod fsm;
pub mod membership;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod router;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod transport;

pub use error::ShardError;

/// Installs the global `tracing` subscriber used by both binaries.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
