//! Command-line configuration for the `shard` and `router` binaries.
//!
//! Arguments are parsed with clap and then turned into plain config structs,
//! which is what the library takes (tests build those directly).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;

/// Runs one member of the replicated key-value store.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run a replicated key-value node")]
pub struct NodeArgs {
    /// Raft member id. Must be unique and non-zero.
    #[arg(long, env = "MEMBER_ID")]
    pub member_id: u64,

    /// Shard id announced to peers. Defaults to the member id.
    #[arg(long, env = "SHARD_ID")]
    pub shard_id: Option<u64>,

    /// Address the HTTP API binds to. Use port 0 for an ephemeral port.
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:8011")]
    pub http_addr: String,

    /// Address the Raft transport binds to.
    #[arg(long, env = "RAFT_ADDR", default_value = "127.0.0.1:18011")]
    pub raft_addr: String,

    /// HTTP address other nodes should use for this node, if different from
    /// the bind address (e.g. a container service name).
    #[arg(long, env = "ADVERTISE_HTTP")]
    pub advertise_http: Option<String>,

    /// The member that bootstraps the group. Every other member waits to be joined.
    #[arg(long, env = "BOOTSTRAP_MEMBER", default_value_t = 1)]
    pub bootstrap_member: u64,

    /// Known peer shards as id=host:port, repeatable or comma-separated.
    #[arg(long = "peer-shard", env = "PEER_SHARDS", value_delimiter = ',', value_parser = parse_peer_shard)]
    pub peer_shards: Vec<(u64, String)>,

    /// HTTP address of an existing member to ask for admission at startup.
    #[arg(long, env = "JOIN")]
    pub join: Option<String>,

    /// How long a request waits for its entry to be applied.
    #[arg(long, env = "APPLY_TIMEOUT_MS", default_value_t = 500)]
    pub apply_timeout_ms: u64,

    /// Applied entries between log compactions.
    #[arg(long, env = "SNAPSHOT_THRESHOLD", default_value_t = 1000)]
    pub snapshot_threshold: u64,

    /// Directory for the Raft log, hard state and snapshots. Without it the
    /// node keeps everything in memory and forgets it on restart.
    #[arg(long, env = "STORE_DIR")]
    pub store_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub member_id: u64,
    pub shard_id: u64,
    pub http_addr: String,
    pub raft_addr: String,
    pub advertise_http: Option<String>,
    pub bootstrap_member: u64,
    pub peer_shards: Vec<(u64, String)>,
    pub join: Option<String>,
    pub apply_timeout: Duration,
    pub snapshot_threshold: u64,
    pub store_dir: Option<PathBuf>,
}

impl NodeConfig {
    /// Loopback defaults with ephemeral ports, for tests and local runs.
    pub fn local(member_id: u64) -> Self {
        Self {
            member_id,
            shard_id: member_id,
            http_addr: "127.0.0.1:0".into(),
            raft_addr: "127.0.0.1:0".into(),
            advertise_http: None,
            bootstrap_member: 1,
            peer_shards: Vec::new(),
            join: None,
            apply_timeout: Duration::from_millis(500),
            snapshot_threshold: 1000,
            store_dir: None,
        }
    }
}

impl TryFrom<NodeArgs> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(args: NodeArgs) -> Result<Self> {
        if args.member_id == 0 {
            return Err(anyhow!("--member-id must be non-zero"));
        }
        Ok(Self {
            member_id: args.member_id,
            shard_id: args.shard_id.unwrap_or(args.member_id),
            http_addr: args.http_addr,
            raft_addr: args.raft_addr,
            advertise_http: args.advertise_http,
            bootstrap_member: args.bootstrap_member,
            peer_shards: args.peer_shards,
            join: args.join,
            apply_timeout: Duration::from_millis(args.apply_timeout_ms),
            snapshot_threshold: args.snapshot_threshold,
            store_dir: args.store_dir,
        })
    }
}

/// Runs the leader-aware router in front of the nodes.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Route key-value requests to the cluster leader")]
pub struct RouterArgs {
    /// Address the router binds to.
    #[arg(long, env = "ROUTER_LISTEN", default_value = "127.0.0.1:8000")]
    pub listen: String,

    /// Node HTTP address, repeatable or comma-separated.
    #[arg(long = "node", env = "ROUTER_NODES", value_delimiter = ',', required = true)]
    pub nodes: Vec<String>,

    /// Leader discovery rounds before giving up on a write.
    #[arg(long, env = "ROUTER_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: usize,

    /// Per-request timeout towards nodes.
    #[arg(long, env = "ROUTER_REQUEST_TIMEOUT_MS", default_value_t = 2000)]
    pub request_timeout_ms: u64,

    /// First backoff delay; doubles with every failed discovery round.
    #[arg(long, env = "ROUTER_BACKOFF_MS", default_value_t = 100)]
    pub backoff_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub listen: String,
    pub nodes: Vec<String>,
    pub max_retries: usize,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
}

impl RouterConfig {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            listen: "127.0.0.1:0".into(),
            nodes,
            max_retries: 5,
            request_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl From<RouterArgs> for RouterConfig {
    fn from(args: RouterArgs) -> Self {
        Self {
            listen: args.listen,
            nodes: args.nodes,
            max_retries: args.max_retries,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            backoff_base: Duration::from_millis(args.backoff_ms),
        }
    }
}

fn parse_peer_shard(entry: &str) -> Result<(u64, String)> {
    let Some((id_str, addr)) = entry.trim().split_once('=') else {
        return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
    };
    let id: u64 = id_str
        .parse()
        .with_context(|| format!("invalid shard id in '{entry}'"))?;
    if addr.is_empty() {
        return Err(anyhow!("missing address in '{entry}'"));
    }
    Ok((id, addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_args_parse_peer_list() {
        let args = NodeArgs::try_parse_from([
            "shard",
            "--member-id",
            "2",
            "--peer-shard",
            "1=shard1:8011,3=shard3:8031",
            "--peer-shard",
            "4=shard4:8041",
        ])
        .unwrap();
        let config = NodeConfig::try_from(args).unwrap();
        assert_eq!(config.shard_id, 2);
        assert_eq!(config.apply_timeout, Duration::from_millis(500));
        assert_eq!(
            config.peer_shards,
            vec![
                (1, "shard1:8011".to_string()),
                (3, "shard3:8031".to_string()),
                (4, "shard4:8041".to_string())
            ]
        );
    }

    #[test]
    fn store_dir_is_passed_through() {
        let args = NodeArgs::try_parse_from([
            "shard",
            "--member-id",
            "1",
            "--store-dir",
            "/var/lib/kv/1",
        ])
        .unwrap();
        let config = NodeConfig::try_from(args).unwrap();
        assert_eq!(config.store_dir, Some(PathBuf::from("/var/lib/kv/1")));
        assert_eq!(NodeConfig::local(1).store_dir, None);
    }

    #[test]
    fn bad_peer_entries_are_rejected() {
        assert!(parse_peer_shard("shard2:8021").is_err());
        assert!(parse_peer_shard("x=shard2:8021").is_err());
        assert!(parse_peer_shard("2=").is_err());
        assert!(NodeArgs::try_parse_from(["shard", "--member-id", "0"])
            .map(NodeConfig::try_from)
            .unwrap()
            .is_err());
    }

    #[test]
    fn router_requires_nodes() {
        assert!(RouterArgs::try_parse_from(["router"]).is_err());
        let args = RouterArgs::try_parse_from(["router", "--node", "a:1,b:2"]).unwrap();
        let config = RouterConfig::from(args);
        assert_eq!(config.nodes, vec!["a:1", "b:2"]);
        assert_eq!(config.max_retries, 5);
    }
}
