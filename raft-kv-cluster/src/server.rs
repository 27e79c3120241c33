//! HTTP surface of a node: data operations through consensus, cluster
//! management, and peer announcements.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broadcast::{Broadcaster, spawn_leader_observer};
use crate::client::NodeClient;
use crate::command::{MemberInfo, Operation};
use crate::config::NodeConfig;
use crate::error::ShardError;
use crate::peers::{KnownPeers, MAX_KNOWN_SHARDS, MergeOutcome};
use crate::protocol::{
    AnnouncementAck, ApiResponse, ConfigData, DeleteRequest, FORWARDED_HEADER, GetQuery,
    GetResponse, JoinRequest, KvData, LeaveRequest, MemberData, PeerView, PutRequest,
    RaftStatusData, ShardAnnouncement,
};
use crate::runtime::{ConsensusConfig, ConsensusHandle, spawn_consensus};

/// Per-call timeout for leader announcements.
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(1);
/// How long join and leave wait for the configuration change to commit.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const JOIN_ATTEMPTS: usize = 60;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct NodeState {
    consensus: ConsensusHandle,
    broadcaster: Broadcaster,
    client: NodeClient,
    apply_timeout: Duration,
    http_addr: String,
}

impl NodeState {
    pub fn new(
        consensus: ConsensusHandle,
        broadcaster: Broadcaster,
        client: NodeClient,
        apply_timeout: Duration,
        http_addr: String,
    ) -> Self {
        Self {
            consensus,
            broadcaster,
            client,
            apply_timeout,
            http_addr,
        }
    }

    fn peers(&self) -> &Arc<KnownPeers> {
        self.broadcaster.peers()
    }

    fn not_leader(&self) -> ShardError {
        ShardError::NotLeader {
            leader: self.consensus.leadership().leader_http,
        }
    }

    /// Refuses to add a node that already has a configuration of its own:
    /// merging two bootstrapped groups would silently lose one of them.
    async fn ensure_unconfigured(&self, member_id: u64, http_addr: &str) -> Result<(), ShardError> {
        match self.client.raft_status(http_addr).await {
            Ok(status) if !status.latest_configuration.is_empty() => Err(ShardError::Membership(format!(
                "member {member_id} already belongs to a group of {} member(s)",
                status.latest_configuration.len()
            ))),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(member = member_id, %http_addr, error = %err, "could not check joiner status, admitting anyway");
                Ok(())
            }
        }
    }
}

pub fn router(state: NodeState) -> Router {
    Router::new()
        .route("/put", put(put_value).post(put_value))
        .route("/get", get(get_value))
        .route("/delete", delete(delete_value).post(delete_value))
        .route("/config", get(cluster_config))
        .route("/addshard", post(add_shard))
        .route("/newleader", post(new_leader))
        .route("/peers", get(known_peers))
        .route("/raft/join", post(join_member))
        .route("/raft/leave", post(leave_member))
        .route("/raft/status", get(raft_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A node whose HTTP server, consensus worker and leader observer are running.
pub struct RunningNode {
    pub http_addr: String,
    pub consensus: ConsensusHandle,
    server: JoinHandle<std::io::Result<()>>,
    observer: JoinHandle<()>,
}

impl RunningNode {
    pub fn raft_addr(&self) -> &str {
        self.consensus.raft_addr()
    }

    /// Waits until the HTTP server stops.
    pub async fn wait(&mut self) -> Result<()> {
        (&mut self.server).await.context("http server task panicked")??;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.server.abort();
        self.observer.abort();
        self.consensus.shutdown();
    }
}

/// Binds the HTTP listener, spawns the consensus member and serves the API.
pub async fn start_node(config: NodeConfig) -> Result<RunningNode> {
    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind http address {}", config.http_addr))?;
    let http_addr = match &config.advertise_http {
        Some(addr) => addr.clone(),
        None => listener.local_addr()?.to_string(),
    };

    let consensus = spawn_consensus(ConsensusConfig {
        id: config.member_id,
        shard_id: config.shard_id,
        raft_addr: config.raft_addr.clone(),
        http_addr: Some(http_addr.clone()),
        bootstrap_member: config.bootstrap_member,
        snapshot_threshold: config.snapshot_threshold,
        store_dir: config.store_dir.clone(),
    })?;

    let peers = Arc::new(KnownPeers::with_seeds(config.shard_id, config.peer_shards.clone()));
    let broadcaster = Broadcaster::new(NodeClient::new(BROADCAST_TIMEOUT)?, peers);
    let observer = spawn_leader_observer(consensus.clone(), broadcaster.clone(), http_addr.clone());

    let client = NodeClient::new(config.apply_timeout + Duration::from_secs(1))?;
    let state = NodeState::new(
        consensus.clone(),
        broadcaster,
        client.clone(),
        config.apply_timeout,
        http_addr.clone(),
    );
    let app = router(state);
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    info!(
        member = config.member_id,
        shard = config.shard_id,
        http = %http_addr,
        raft = %consensus.raft_addr(),
        "node listening"
    );

    if let Some(seed) = config.join.clone() {
        if consensus.status().await?.configuration.is_empty() {
            let request = JoinRequest {
                member_id: config.member_id,
                address: consensus.raft_addr().to_string(),
                http_address: Some(http_addr.clone()),
                shard_id: Some(config.shard_id),
            };
            tokio::spawn(request_admission(client, seed, request));
        } else {
            info!(member = config.member_id, "stored configuration found, not asking to join");
        }
    }

    Ok(RunningNode {
        http_addr,
        consensus,
        server,
        observer,
    })
}

/// Asks `seed` to add this node, following not-leader hints.
async fn request_admission(client: NodeClient, seed: String, request: JoinRequest) {
    let mut target = seed.clone();
    for attempt in 1..=JOIN_ATTEMPTS {
        match client.join(&target, &request).await {
            Ok(reply) if reply.status.is_success() => {
                info!(member = request.member_id, via = %target, "joined group");
                return;
            }
            Ok(reply) if reply.is_not_leader() => {
                target = reply.leader_hint().map(str::to_owned).unwrap_or_else(|| seed.clone());
            }
            Ok(reply) if reply.status == StatusCode::CONFLICT => {
                warn!(member = request.member_id, body = %reply.body, "join refused");
                return;
            }
            Ok(reply) => warn!(member = request.member_id, attempt, status = %reply.status, "join attempt failed"),
            Err(err) => warn!(member = request.member_id, attempt, error = %err, "join attempt failed"),
        }
        tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
    }
    warn!(member = request.member_id, "giving up on joining after {JOIN_ATTEMPTS} attempts");
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ShardError> {
    body.map(|Json(value)| value)
        .map_err(|_| ShardError::Validation("Invalid JSON format".into()))
}

async fn put_value(
    State(node): State<NodeState>,
    body: Result<Json<PutRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<KvData>>, ShardError> {
    let req = parse_body(body)?;
    if req.key.is_empty() || req.value.is_empty() {
        return Err(ShardError::Validation("Key and value are required in JSON body".into()));
    }
    let op = Operation::Put {
        key: req.key.clone(),
        value: req.value,
    };
    let value = node.consensus.apply(op, node.apply_timeout).await?;
    info!(key = %req.key, "stored key");
    Ok(Json(ApiResponse::ok(
        "Key-value pair stored successfully",
        KvData {
            key: req.key,
            value: Some(value),
        },
    )))
}

/// Reads go through the log like writes. A follower that knows its leader
/// forwards the read there once, so any node can answer.
async fn get_value(
    State(node): State<NodeState>,
    headers: HeaderMap,
    Query(query): Query<GetQuery>,
) -> Result<Response, ShardError> {
    let key = query
        .key
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ShardError::Validation("Key parameter is required".into()))?;

    if !headers.contains_key(FORWARDED_HEADER) && !node.consensus.is_leader() {
        let leader = node
            .consensus
            .leadership()
            .leader_http
            .filter(|addr| *addr != node.http_addr);
        if let Some(leader) = leader {
            let reply = node.client.get(&leader, &key, true).await?;
            return Ok(reply.into_response());
        }
    }

    match node
        .consensus
        .apply(Operation::Get { key: key.clone() }, node.apply_timeout)
        .await
    {
        Ok(value) => Ok(Json(GetResponse::found(key, value)).into_response()),
        Err(ShardError::KeyNotFound) => {
            Ok((StatusCode::NOT_FOUND, Json(GetResponse::missing(key))).into_response())
        }
        Err(err) => Err(err),
    }
}

async fn delete_value(
    State(node): State<NodeState>,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<KvData>>, ShardError> {
    let req = parse_body(body)?;
    if req.key.is_empty() {
        return Err(ShardError::Validation("Key parameter is required in JSON body".into()));
    }
    node.consensus
        .apply(Operation::Delete { key: req.key.clone() }, node.apply_timeout)
        .await?;
    info!(key = %req.key, "deleted key");
    Ok(Json(ApiResponse::ok(
        "Key deleted successfully",
        KvData {
            key: req.key,
            value: None,
        },
    )))
}

async fn cluster_config(State(node): State<NodeState>) -> Result<Json<ApiResponse<ConfigData>>, ShardError> {
    let status = node.consensus.status().await?;
    let mut shards: BTreeMap<u64, String> = status
        .configuration
        .iter()
        .map(|server| {
            let addr = server.http_address.clone().unwrap_or_else(|| server.address.clone());
            (server.shard_id, addr)
        })
        .collect();
    if shards.is_empty() {
        shards = node.peers().addresses();
        shards.insert(node.consensus.shard_id(), node.http_addr.clone());
    }
    Ok(Json(ApiResponse::ok(
        "Configuration retrieved successfully",
        ConfigData {
            shard_count: shards.len(),
            shards,
        },
    )))
}

fn merge_announcement(
    node: &NodeState,
    body: Result<Json<ShardAnnouncement>, JsonRejection>,
) -> Result<AnnouncementAck, ShardError> {
    let announcement = parse_body(body)?;
    if announcement.address.is_empty() {
        return Err(ShardError::Validation("ShardID and ShardAddress are required".into()));
    }
    let shard_id = announcement.shard_id;
    let outcome = node.broadcaster.accept(announcement);
    if outcome == MergeOutcome::Full {
        return Err(ShardError::Validation(format!(
            "Cannot track more than {MAX_KNOWN_SHARDS} shards"
        )));
    }
    let entry = node
        .peers()
        .get(shard_id)
        .ok_or_else(|| ShardError::Internal(format!("shard {shard_id} missing after merge")))?;
    Ok(AnnouncementAck {
        shard_id,
        address: entry.address,
        term: entry.term,
        changed: outcome.changed(),
    })
}

async fn add_shard(
    State(node): State<NodeState>,
    body: Result<Json<ShardAnnouncement>, JsonRejection>,
) -> Result<Json<ApiResponse<AnnouncementAck>>, ShardError> {
    let ack = merge_announcement(&node, body)?;
    info!(shard = ack.shard_id, address = %ack.address, "added shard");
    Ok(Json(ApiResponse::ok("Shard added successfully", ack)))
}

async fn new_leader(
    State(node): State<NodeState>,
    body: Result<Json<ShardAnnouncement>, JsonRejection>,
) -> Result<Json<ApiResponse<AnnouncementAck>>, ShardError> {
    let ack = merge_announcement(&node, body)?;
    info!(shard = ack.shard_id, address = %ack.address, term = ack.term, "leader announcement");
    Ok(Json(ApiResponse::ok("Leader information updated successfully", ack)))
}

async fn known_peers(State(node): State<NodeState>) -> Json<ApiResponse<BTreeMap<u64, PeerView>>> {
    Json(ApiResponse::ok("Known peers retrieved successfully", node.peers().views()))
}

async fn join_member(
    State(node): State<NodeState>,
    body: Result<Json<JoinRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<MemberData>>, ShardError> {
    let req = parse_body(body)?;
    if req.member_id == 0 || req.address.is_empty() {
        return Err(ShardError::Validation("NodeID and address are required".into()));
    }
    if !node.consensus.is_leader() {
        return Err(node.not_leader());
    }
    if let Some(http_addr) = &req.http_address {
        node.ensure_unconfigured(req.member_id, http_addr).await?;
    }

    let info = MemberInfo {
        shard_id: req.shard_id.unwrap_or(req.member_id),
        raft_addr: req.address.clone(),
        http_addr: req.http_address.clone(),
    };
    node.consensus
        .add_voter(req.member_id, info, MEMBERSHIP_TIMEOUT)
        .await?;
    info!(member = req.member_id, address = %req.address, "member joined");
    Ok(Json(ApiResponse::ok(
        "Node joined successfully",
        MemberData {
            member_id: req.member_id,
            address: Some(req.address),
        },
    )))
}

async fn leave_member(
    State(node): State<NodeState>,
    body: Result<Json<LeaveRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<MemberData>>, ShardError> {
    let req = parse_body(body)?;
    if req.member_id == 0 {
        return Err(ShardError::Validation("NodeID is required".into()));
    }
    if !node.consensus.is_leader() {
        return Err(node.not_leader());
    }
    node.consensus
        .remove_server(req.member_id, MEMBERSHIP_TIMEOUT)
        .await?;
    info!(member = req.member_id, "member removed");
    Ok(Json(ApiResponse::ok(
        "Node removed successfully",
        MemberData {
            member_id: req.member_id,
            address: None,
        },
    )))
}

async fn raft_status(State(node): State<NodeState>) -> Result<Json<ApiResponse<RaftStatusData>>, ShardError> {
    let status = node.consensus.status().await?;
    let data = RaftStatusData {
        id: status.id,
        shard_id: status.shard_id,
        state: status.role,
        term: status.term,
        leader: (status.leader_id != 0).then_some(status.leader_id),
        leader_address: status.leader_http.clone(),
        num_peers: status.num_peers(),
        commit_index: status.commit_index,
        applied_index: status.applied_index,
        snapshot_index: status.snapshot_index,
        join_state: status.join_state,
        latest_configuration: status.configuration,
    };
    Ok(Json(ApiResponse::ok("Raft status retrieved successfully", data)))
}
