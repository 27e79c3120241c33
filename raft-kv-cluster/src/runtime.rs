//! Worker runtime for a consensus member.
//!
//! This module orchestrates the threading model:
//!
//! - **Worker thread**: Owns the [`RaftNode`], runs the Raft event loop
//! - **Transport threads**: Listener and per-peer links (see [`crate::transport`])
//! - **Async callers**: HTTP handlers talk to the worker through [`ConsensusHandle`]
//!
//! Requests reach the worker over crossbeam channels and are answered on
//! tokio oneshot channels, so async code can await a result under a
//! timeout without blocking a runtime thread. Leadership changes are pushed
//! on a `tokio::sync::watch` channel instead of being polled.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use raft::StateRole;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::command::{MemberInfo, Operation, RequestId};
use crate::error::ShardError;
use crate::fsm::{ApplyResult, KvStateMachine};
use crate::membership::{BootstrapPolicy, JoinState, MemberDirectory, ServerEntry};
use crate::node::{AppliedOutcome, ApplyReport, RaftNode};
use crate::storage::ShardStorage;
use crate::transport::{self, Inbound, Outbound};

/// Raft logical clock interval.
///
/// The worker calls `node.tick()` every 100ms, which drives Raft's timeout logic:
/// - Heartbeat timeout: 3 ticks = 300ms
/// - Election timeout: 10 ticks = 1000ms
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for spawning a consensus member.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub id: u64,
    pub shard_id: u64,
    /// Address to bind for incoming Raft traffic. Port 0 picks a free port,
    /// which is then advertised to peers.
    pub raft_addr: String,
    /// HTTP address peers and clients should use for this member.
    pub http_addr: Option<String>,
    pub bootstrap_member: u64,
    pub snapshot_threshold: u64,
    /// Directory holding this member's Raft state. `None` keeps everything in
    /// memory, so a restart starts from scratch.
    pub store_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl From<StateRole> for NodeRole {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Leader => NodeRole::Leader,
            StateRole::Candidate | StateRole::PreCandidate => NodeRole::Candidate,
            StateRole::Follower => NodeRole::Follower,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeRole::Follower => "Follower",
            NodeRole::Candidate => "Candidate",
            NodeRole::Leader => "Leader",
        };
        f.write_str(name)
    }
}

/// Who this member currently believes leads the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipView {
    pub role: NodeRole,
    pub term: u64,
    /// 0 when no leader is known.
    pub leader_id: u64,
    pub leader_http: Option<String>,
}

/// Point-in-time report of a member's consensus state.
#[derive(Debug, Clone)]
pub struct ConsensusStatus {
    pub id: u64,
    pub shard_id: u64,
    pub role: NodeRole,
    pub term: u64,
    pub leader_id: u64,
    pub leader_http: Option<String>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub snapshot_index: u64,
    pub join_state: JoinState,
    pub configuration: Vec<ServerEntry>,
}

impl ConsensusStatus {
    /// Members other than this one in the committed configuration.
    pub fn num_peers(&self) -> usize {
        self.configuration.iter().filter(|s| s.id != self.id).count()
    }
}

/// Handle for sending requests to a running consensus worker.
///
/// Cheap to clone; every clone talks to the same worker.
#[derive(Clone)]
pub struct ConsensusHandle {
    id: u64,
    shard_id: u64,
    raft_addr: String,
    request_tx: Sender<WorkerRequest>,
    leadership: watch::Receiver<LeadershipView>,
    fsm: Arc<KvStateMachine>,
}

impl ConsensusHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    /// The Raft address advertised to peers.
    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    /// Replicates `op` and waits up to `timeout` for it to be applied.
    ///
    /// A timeout means the outcome is unknown: the entry may still commit.
    pub async fn apply(&self, op: Operation, timeout: Duration) -> ApplyResult {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerRequest::Apply { op, respond_to: tx })?;
        await_reply(rx, timeout).await?
    }

    /// Adds a voter and waits for the configuration change to commit.
    pub async fn add_voter(&self, id: u64, info: MemberInfo, timeout: Duration) -> Result<(), ShardError> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerRequest::AddVoter {
            id,
            info,
            respond_to: tx,
        })?;
        await_reply(rx, timeout).await?
    }

    /// Removes a member and waits for the configuration change to commit.
    pub async fn remove_server(&self, id: u64, timeout: Duration) -> Result<(), ShardError> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerRequest::Remove { id, respond_to: tx })?;
        await_reply(rx, timeout).await?
    }

    pub async fn status(&self) -> Result<ConsensusStatus, ShardError> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerRequest::Status { respond_to: tx })?;
        rx.await
            .map_err(|_| ShardError::Internal("consensus worker dropped status request".into()))
    }

    /// Forces this member to start an election.
    pub async fn campaign(&self) -> Result<(), ShardError> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerRequest::Campaign { respond_to: tx })?;
        rx.await
            .map_err(|_| ShardError::Internal("consensus worker dropped campaign request".into()))?
    }

    /// The latest leadership view, without a round trip to the worker.
    pub fn leadership(&self) -> LeadershipView {
        self.leadership.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.borrow().role == NodeRole::Leader
    }

    /// Notified every time the leadership view changes.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipView> {
        self.leadership.clone()
    }

    /// Applied state, for diagnostics and tests. Not a linearizable read.
    pub fn fsm(&self) -> &Arc<KvStateMachine> {
        &self.fsm
    }

    /// Signals the worker to stop. Pending callers see an internal error.
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(WorkerRequest::Shutdown);
    }

    fn send(&self, req: WorkerRequest) -> Result<(), ShardError> {
        self.request_tx
            .send(req)
            .map_err(|_| ShardError::Internal("consensus worker stopped".into()))
    }
}

async fn await_reply<T>(rx: oneshot::Receiver<T>, timeout: Duration) -> Result<T, ShardError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(ShardError::Internal("consensus worker dropped request".into())),
        Err(_) => Err(ShardError::ConsensusTimeout),
    }
}

enum WorkerRequest {
    Apply {
        op: Operation,
        respond_to: oneshot::Sender<ApplyResult>,
    },
    AddVoter {
        id: u64,
        info: MemberInfo,
        respond_to: oneshot::Sender<Result<(), ShardError>>,
    },
    Remove {
        id: u64,
        respond_to: oneshot::Sender<Result<(), ShardError>>,
    },
    Status {
        respond_to: oneshot::Sender<ConsensusStatus>,
    },
    Campaign {
        respond_to: oneshot::Sender<Result<(), ShardError>>,
    },
    Shutdown,
}

/// A caller waiting for its proposal to be applied.
enum Pending {
    Command(oneshot::Sender<ApplyResult>),
    Membership(oneshot::Sender<Result<(), ShardError>>),
}

impl Pending {
    fn is_closed(&self) -> bool {
        match self {
            Pending::Command(tx) => tx.is_closed(),
            Pending::Membership(tx) => tx.is_closed(),
        }
    }

    fn fail(self, err: ShardError) {
        match self {
            Pending::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Membership(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Spawns a consensus member and returns a handle to interact with it.
///
/// On a fresh store the member named by `bootstrap_member` creates a
/// one-member group and campaigns immediately; every other member waits to
/// be added by a leader. A member reloaded from `store_dir` resumes with its
/// stored configuration instead.
pub fn spawn_consensus(config: ConsensusConfig) -> Result<ConsensusHandle> {
    let (network_tx, network_rx) = unbounded();
    let bound = transport::spawn_listener(&config.raft_addr, network_tx)?;
    let raft_addr = advertised_addr(&config.raft_addr, bound);

    let fsm = Arc::new(KvStateMachine::new());
    let info = MemberInfo {
        shard_id: config.shard_id,
        raft_addr: raft_addr.clone(),
        http_addr: config.http_addr.clone(),
    };
    let members = Arc::new(RwLock::new(MemberDirectory::new()));
    let storage = match &config.store_dir {
        Some(dir) => ShardStorage::open(dir, fsm.clone(), members)?,
        None => ShardStorage::new(fsm.clone(), members),
    };
    let mut node = RaftNode::with_storage(
        config.id,
        info,
        BootstrapPolicy::new(config.bootstrap_member),
        storage,
        config.snapshot_threshold,
    )?;
    match (node.join_state(), node.restored()) {
        (JoinState::BootstrappedSoloLeader, restored) => {
            // Sole voter: nobody else can elect it.
            node.campaign()?;
            if restored {
                info!(member = config.id, term = node.term(), "resumed single-member group");
            } else {
                info!(member = config.id, "bootstrapped single-member group");
            }
        }
        (state, true) => {
            info!(member = config.id, ?state, voters = ?node.voters(), "resumed from stored state");
        }
        (_, false) => info!(member = config.id, "awaiting join by an existing leader"),
    }

    let (client_tx, client_rx) = unbounded();
    let (leader_tx, leader_rx) = watch::channel(leadership_of(&node));
    let outbound = Outbound::new(config.id, raft_addr.clone());

    let id = config.id;
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = Worker::new(node, outbound, client_rx, network_rx, leader_tx).run() {
                error!(member = id, error = ?err, "raft worker crashed");
            }
        })
        .context("failed to spawn raft worker")?;

    Ok(ConsensusHandle {
        id: config.id,
        shard_id: config.shard_id,
        raft_addr,
        request_tx: client_tx,
        leadership: leader_rx,
        fsm,
    })
}

fn advertised_addr(requested: &str, bound: SocketAddr) -> String {
    match requested.parse::<SocketAddr>() {
        Ok(addr) if addr.port() == 0 => bound.to_string(),
        _ => requested.to_string(),
    }
}

fn leadership_of(node: &RaftNode) -> LeadershipView {
    LeadershipView {
        role: node.role().into(),
        term: node.term(),
        leader_id: node.leader_id(),
        leader_http: node.leader_http_hint(),
    }
}

/// The worker that runs the Raft event loop.
///
/// Owns the RaftNode and processes three types of events:
/// 1. **Client requests** from [`ConsensusHandle`]s
/// 2. **Network messages** (Raft protocol) from peers
/// 3. **Tick events** (every 100ms) to drive Raft timeouts
struct Worker {
    node: RaftNode,
    outbound: Outbound,
    client_rx: Receiver<WorkerRequest>,
    network_rx: Receiver<Inbound>,
    leader_tx: watch::Sender<LeadershipView>,
    pending: HashMap<RequestId, Pending>,
    /// Raft addresses learned from envelopes, for peers whose directory
    /// entry has not been applied locally yet.
    learned_addrs: HashMap<u64, String>,
    last_role: StateRole,
}

impl Worker {
    fn new(
        node: RaftNode,
        outbound: Outbound,
        client_rx: Receiver<WorkerRequest>,
        network_rx: Receiver<Inbound>,
        leader_tx: watch::Sender<LeadershipView>,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            outbound,
            client_rx,
            network_rx,
            leader_tx,
            pending: HashMap::new(),
            learned_addrs: HashMap::new(),
            last_role,
        }
    }

    /// Runs the main event loop until shutdown.
    ///
    /// Each iteration waits (bounded by the next tick) for a client request
    /// or a network message, ticks if due, drains Raft's ready state, then
    /// publishes any leadership change.
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::from_secs(0));

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> inbound => {
                    match inbound {
                        Ok(inbound) => self.handle_inbound(inbound),
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                self.pending.retain(|_, p| !p.is_closed());
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.observe_leadership();
        }

        info!(member = self.node.id(), "raft worker stopped");
        Ok(())
    }

    /// Returns `false` if shutdown was requested.
    fn handle_request(&mut self, req: WorkerRequest) -> Result<bool> {
        match req {
            WorkerRequest::Apply { op, respond_to } => match self.node.propose(op) {
                Ok(request) => {
                    self.pending.insert(request, Pending::Command(respond_to));
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            WorkerRequest::AddVoter { id, info, respond_to } => {
                match self.node.propose_add_voter(id, info) {
                    Ok(request) => {
                        self.pending.insert(request, Pending::Membership(respond_to));
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            WorkerRequest::Remove { id, respond_to } => match self.node.propose_remove(id) {
                Ok(request) => {
                    self.pending.insert(request, Pending::Membership(respond_to));
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            WorkerRequest::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            WorkerRequest::Campaign { respond_to } => {
                let result = self.node.campaign().map_err(ShardError::from);
                if result.is_ok() {
                    info!(member = self.node.id(), role = ?self.node.role(), "campaign initiated");
                }
                let _ = respond_to.send(result);
            }
            WorkerRequest::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        if !inbound.from_addr.is_empty() {
            self.learned_addrs.insert(inbound.from, inbound.from_addr);
        }
        if let Err(err) = self.node.step(inbound.message) {
            warn!(member = self.node.id(), from = inbound.from, error = ?err, "rejected raft message");
        }
    }

    /// Drains all ready state from Raft: dispatch messages first, then
    /// notify waiting callers.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.notify(report);
            }
        }
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            self.node.step(msg)?;
            return Ok(());
        }

        let to = msg.to;
        let addr = self
            .node
            .member_raft_addr(to)
            .or_else(|| self.learned_addrs.get(&to).cloned());
        let Some(addr) = addr else {
            warn!(member = self.node.id(), peer = to, "no address for peer, dropping message");
            return Ok(());
        };
        self.outbound.send(&addr, &msg)
    }

    fn notify(&mut self, report: ApplyReport) {
        match &report.outcome {
            AppliedOutcome::Command { op, result } => debug!(
                member = report.node_id,
                index = report.index,
                term = report.term,
                op = op.name(),
                key = op.key(),
                ok = result.is_ok(),
                "applied entry"
            ),
            AppliedOutcome::MemberRemoved { id } => {
                self.outbound.forget(*id);
                self.learned_addrs.remove(id);
            }
            AppliedOutcome::MemberAdded { .. } => {}
        }

        let Some(request) = report.request else {
            return;
        };
        let Some(pending) = self.pending.remove(&request) else {
            return;
        };
        match (pending, report.outcome) {
            (Pending::Command(tx), AppliedOutcome::Command { result, .. }) => {
                let _ = tx.send(result);
            }
            (Pending::Membership(tx), _) => {
                let _ = tx.send(Ok(()));
            }
            (Pending::Command(tx), _) => {
                let _ = tx.send(Err(ShardError::Internal("request id matched a membership entry".into())));
            }
        }
    }

    /// Publishes leadership changes and fails in-flight proposals when this
    /// member stops leading: their entries may still commit under the new
    /// leader, so the outcome is reported as unknown.
    fn observe_leadership(&mut self) {
        let current = self.node.role();
        if current != self.last_role {
            info!(
                member = self.node.id(),
                from = ?self.last_role,
                to = ?current,
                leader = self.node.leader_id(),
                term = self.node.term(),
                "role changed"
            );
            if self.last_role == StateRole::Leader && !self.pending.is_empty() {
                warn!(member = self.node.id(), pending = self.pending.len(), "leadership lost with requests in flight");
                for (_, pending) in self.pending.drain() {
                    pending.fail(ShardError::LeadershipLost);
                }
            }
            self.last_role = current;
        }

        let view = leadership_of(&self.node);
        self.leader_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn status(&self) -> ConsensusStatus {
        let view = leadership_of(&self.node);
        ConsensusStatus {
            id: self.node.id(),
            shard_id: self.node.self_info().shard_id,
            role: view.role,
            term: view.term,
            leader_id: view.leader_id,
            leader_http: view.leader_http,
            commit_index: self.node.commit_index(),
            applied_index: self.node.applied_index(),
            snapshot_index: self.node.snapshot_index(),
            join_state: self.node.join_state(),
            configuration: self.node.configuration(),
        }
    }
}
