//! Core Raft node implementation.
//!
//! This module wraps the tikv/raft library to provide a simplified interface for
//! running one member of the replication group. [`RaftNode`] combines the raw
//! Raft state machine with the key-value FSM, the member directory and the
//! join state, and turns committed entries into [`ApplyReport`]s.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode,
};
use raft::{StateRole, Storage};
use slog::{o, Logger};
use tracing::{debug, info, warn};

use crate::command::{CommandPayload, MemberInfo, MembershipContext, Operation, RequestId};
use crate::error::ShardError;
use crate::fsm::{ApplyResult, KvStateMachine};
use crate::membership::{BootstrapPolicy, JoinState, MemberDirectory, ServerEntry};
use crate::storage::ShardStorage;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a logger, but we handle logging at the application
/// level instead with `tracing`.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// What a committed entry did once applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedOutcome {
    Command { op: Operation, result: ApplyResult },
    MemberAdded { id: u64 },
    MemberRemoved { id: u64 },
}

/// Records details when a committed entry is applied on this node.
///
/// The runtime matches `request` against its pending proposals to wake the
/// waiting caller; followers produce the same reports with nobody waiting.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub node_id: u64,
    pub index: u64,
    pub term: u64,
    pub request: Option<RequestId>,
    pub outcome: AppliedOutcome,
}

/// Output from processing a Raft ready state.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

/// One member of the replication group.
///
/// The worker thread owns this value exclusively; only the FSM and the member
/// directory are shared (read-only) with other threads.
pub struct RaftNode {
    id: u64,
    raw: RawNode<ShardStorage>,
    storage: ShardStorage,
    fsm: Arc<KvStateMachine>,
    members: Arc<RwLock<MemberDirectory>>,
    self_info: MemberInfo,
    join_state: JoinState,
    restored: bool,
    conf_state: ConfState,
    applied_index: u64,
    snapshot_index: u64,
    snapshot_threshold: u64,
    next_seq: u64,
}

impl RaftNode {
    /// Creates a node with in-memory storage that either bootstraps a
    /// one-member group or waits to be added by an existing leader, as decided
    /// by `policy`.
    pub fn new(
        id: u64,
        self_info: MemberInfo,
        policy: BootstrapPolicy,
        fsm: Arc<KvStateMachine>,
        snapshot_threshold: u64,
    ) -> Result<Self> {
        let members = Arc::new(RwLock::new(MemberDirectory::new()));
        let storage = ShardStorage::new(fsm, members);
        Self::with_storage(id, self_info, policy, storage, snapshot_threshold)
    }

    /// Creates a node on top of `storage`.
    ///
    /// Storage reloaded from disk is never bootstrapped again: the member
    /// resumes with its stored configuration, and `policy` only applies to a
    /// store that has never held Raft state.
    ///
    /// # Raft timing configuration
    ///
    /// - `election_tick: 10`: Elections triggered after ~1 second of no leader heartbeats
    /// - `heartbeat_tick: 3`: Leader sends heartbeats every ~300ms
    /// - Assumes each `tick()` call happens every 100ms (set by runtime)
    pub fn with_storage(
        id: u64,
        self_info: MemberInfo,
        policy: BootstrapPolicy,
        storage: ShardStorage,
        snapshot_threshold: u64,
    ) -> Result<Self> {
        let fsm = storage.fsm().clone();
        let members = storage.members().clone();
        let restored = storage.restored();
        let join_state = if restored {
            let stored = storage.initial_state().context("read stored raft state")?;
            JoinState::recovered(id, &stored.conf_state.voters)
        } else {
            policy.initial_state(id)
        };
        if !restored && join_state == JoinState::BootstrappedSoloLeader {
            storage.bootstrap(id, self_info.clone())?;
        }

        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        let initial = storage.initial_state().context("read initial raft state")?;
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        let snapshot_index = storage.first_index().context("read first index")? - 1;

        Ok(Self {
            id,
            raw,
            storage,
            fsm,
            members,
            self_info,
            join_state,
            restored,
            conf_state: initial.conf_state,
            applied_index: snapshot_index,
            snapshot_index,
            snapshot_threshold,
            // Replayed entries carry ids from earlier runs of this member.
            next_seq: u64::from(rand::random::<u32>()) << 32,
        })
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election to become leader.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn commit_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn join_state(&self) -> JoinState {
        self.join_state
    }

    /// True when this node resumed from stored state instead of starting fresh.
    pub fn restored(&self) -> bool {
        self.restored
    }

    pub fn self_info(&self) -> &MemberInfo {
        &self.self_info
    }

    pub fn voters(&self) -> &[u64] {
        &self.conf_state.voters
    }

    pub fn fsm(&self) -> &Arc<KvStateMachine> {
        &self.fsm
    }

    /// Raft address of a member, as recorded in the replicated directory.
    pub fn member_raft_addr(&self, id: u64) -> Option<String> {
        self.directory().raft_addr(id).map(str::to_owned)
    }

    /// HTTP address of the current leader, when both are known.
    pub fn leader_http_hint(&self) -> Option<String> {
        match self.leader_id() {
            0 => None,
            leader => self.directory().http_addr(leader).map(str::to_owned),
        }
    }

    /// The committed membership list with addresses.
    pub fn configuration(&self) -> Vec<ServerEntry> {
        self.directory()
            .configuration(&self.conf_state.voters, &self.conf_state.learners)
    }

    /// Proposes a key-value operation.
    ///
    /// Success only means "appended to the leader's log"; the result arrives
    /// later as an [`ApplyReport`] carrying the returned request id.
    pub fn propose(&mut self, op: Operation) -> Result<RequestId, ShardError> {
        self.ensure_leader()?;
        let request = self.next_request();
        let data = CommandPayload { request, op }.encode()?;
        self.raw
            .propose(vec![], data)
            .map_err(|err| ShardError::Internal(format!("propose failed: {err}")))?;
        Ok(request)
    }

    /// Proposes adding `id` as a voter.
    pub fn propose_add_voter(&mut self, id: u64, info: MemberInfo) -> Result<RequestId, ShardError> {
        self.ensure_leader()?;
        self.ensure_no_pending_conf()?;
        if self.conf_state.voters.contains(&id) {
            return Err(ShardError::Membership(format!("member {id} is already a voter")));
        }
        self.propose_membership(ConfChangeType::AddNode, id, Some(info))
    }

    /// Proposes removing `id` from the configuration.
    pub fn propose_remove(&mut self, id: u64) -> Result<RequestId, ShardError> {
        self.ensure_leader()?;
        self.ensure_no_pending_conf()?;
        if !self.conf_state.voters.contains(&id) && !self.conf_state.learners.contains(&id) {
            return Err(ShardError::Membership(format!(
                "member {id} is not part of the configuration"
            )));
        }
        if self.conf_state.voters == [id] {
            return Err(ShardError::Membership("cannot remove the last voter".into()));
        }
        self.propose_membership(ConfChangeType::RemoveNode, id, None)
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// Follows Raft's two-phase protocol (Ready, then LightReady). Within
    /// the first phase a received snapshot is installed before committed
    /// entries are applied, and entries are applied before new ones are
    /// appended, so the FSM always reflects the hard state's commit index
    /// once this returns.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        outbound.extend(ready.take_messages());

        if !ready.snapshot().is_empty() {
            self.storage
                .install(ready.snapshot())
                .context("install snapshot failed")?;
            let meta = ready.snapshot().get_metadata();
            self.applied_index = meta.index;
            self.snapshot_index = meta.index;
            self.conf_state = meta.get_conf_state().clone();
            self.refresh_join_state();
            info!(
                member = self.id,
                index = self.snapshot_index,
                keys = self.fsm.len(),
                "installed snapshot from leader"
            );
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);

        self.storage
            .append(ready.entries())
            .context("append entries failed")?;

        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state.clone())?;
        }

        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit)?;
        }

        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();
        self.maybe_compact()?;

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut applied = Vec::new();
        for entry in entries {
            self.applied_index = entry.index;
            if entry.data.is_empty() {
                continue;
            }
            match entry.entry_type() {
                EntryType::EntryNormal => {
                    let command = CommandPayload::decode(&entry.data[..])
                        .context("decode command failed")?;
                    let result = self.fsm.apply(&command.op);
                    applied.push(ApplyReport {
                        node_id: self.id,
                        index: entry.index,
                        term: entry.term,
                        request: Some(command.request),
                        outcome: AppliedOutcome::Command {
                            op: command.op,
                            result,
                        },
                    });
                }
                EntryType::EntryConfChange => {
                    let cc = ConfChange::decode(&entry.data[..]).context("decode conf change failed")?;
                    applied.push(self.apply_conf_change(&cc, entry.index, entry.term)?);
                }
                EntryType::EntryConfChangeV2 => {
                    warn!(member = self.id, index = entry.index, "ignoring joint-consensus entry");
                }
            }
        }
        Ok(applied)
    }

    fn apply_conf_change(&mut self, cc: &ConfChange, index: u64, term: u64) -> Result<ApplyReport> {
        let context = if cc.context.is_empty() {
            None
        } else {
            Some(MembershipContext::decode(&cc.context[..])?)
        };
        let conf_state = self
            .raw
            .apply_conf_change(cc)
            .context("apply conf change failed")?;
        self.storage.set_conf_state(conf_state.clone())?;
        self.conf_state = conf_state;

        let outcome = {
            let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
            match cc.change_type() {
                ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                    if let Some(member) = context.as_ref().and_then(|c| c.member.clone()) {
                        members.insert(cc.node_id, member);
                    }
                    AppliedOutcome::MemberAdded { id: cc.node_id }
                }
                ConfChangeType::RemoveNode => {
                    members.remove(cc.node_id);
                    AppliedOutcome::MemberRemoved { id: cc.node_id }
                }
            }
        };
        self.refresh_join_state();
        info!(
            member = self.id,
            index,
            voters = ?self.conf_state.voters,
            change = ?outcome,
            "applied membership change"
        );

        Ok(ApplyReport {
            node_id: self.id,
            index,
            term,
            request: context.map(|c| c.request),
            outcome,
        })
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.snapshot_threshold == 0
            || self.applied_index < self.snapshot_index + self.snapshot_threshold
        {
            return Ok(());
        }
        self.storage.compact(self.applied_index)?;
        debug!(
            member = self.id,
            from = self.snapshot_index,
            to = self.applied_index,
            "compacted raft log"
        );
        self.snapshot_index = self.applied_index;
        Ok(())
    }

    fn refresh_join_state(&mut self) {
        let voters = &self.conf_state.voters;
        let is_voter = voters.contains(&self.id);
        self.join_state = match self.join_state {
            JoinState::BootstrappedSoloLeader if is_voter && voters.len() == 1 => {
                JoinState::BootstrappedSoloLeader
            }
            JoinState::Removed => JoinState::Removed,
            _ if is_voter => JoinState::Member,
            JoinState::Member | JoinState::BootstrappedSoloLeader => JoinState::Removed,
            other => other,
        };
    }

    fn propose_membership(
        &mut self,
        change: ConfChangeType,
        id: u64,
        member: Option<MemberInfo>,
    ) -> Result<RequestId, ShardError> {
        let request = self.next_request();
        let mut cc = ConfChange::default();
        cc.node_id = id;
        cc.set_change_type(change);
        cc.context = MembershipContext { request, member }.encode()?.into();
        self.raw
            .propose_conf_change(vec![], cc)
            .map_err(|err| ShardError::Membership(format!("propose conf change failed: {err}")))?;
        Ok(request)
    }

    fn ensure_leader(&self) -> Result<(), ShardError> {
        if self.role() == StateRole::Leader {
            Ok(())
        } else {
            Err(ShardError::NotLeader {
                leader: self.leader_http_hint(),
            })
        }
    }

    fn ensure_no_pending_conf(&self) -> Result<(), ShardError> {
        if self.raw.raft.has_pending_conf() {
            Err(ShardError::Membership(
                "another membership change is still being committed".into(),
            ))
        } else {
            Ok(())
        }
    }

    fn next_request(&mut self) -> RequestId {
        let seq = self.next_seq;
        self.next_seq += 1;
        RequestId {
            proposer: self.id,
            seq,
        }
    }

    fn directory(&self) -> std::sync::RwLockReadGuard<'_, MemberDirectory> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }
}
