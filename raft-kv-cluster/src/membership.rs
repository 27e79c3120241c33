//! Group membership bookkeeping.
//!
//! Voter sets live inside Raft's `ConfState`; this module keeps the address
//! metadata that Raft does not track, and the per-node join state machine:
//!
//! ```text
//! start ──(id == bootstrap member)──> BootstrappedSoloLeader ──┐
//!   │                                                          ├─> Member ──> Removed
//!   └────────────(any other id)────> AwaitingJoin ─────────────┘
//! ```
//!
//! Exactly one node may bootstrap. Two self-bootstrapped nodes form two
//! disjoint single-member groups that never converge. A node restarting from
//! stored state skips the decision and resumes in the state its stored voter
//! set implies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::MemberInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    BootstrappedSoloLeader,
    AwaitingJoin,
    Member,
    Removed,
}

/// Static rule deciding which node creates the group.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapPolicy {
    bootstrap_member: u64,
}

impl BootstrapPolicy {
    pub fn new(bootstrap_member: u64) -> Self {
        Self { bootstrap_member }
    }

    pub fn should_bootstrap(&self, member_id: u64) -> bool {
        member_id == self.bootstrap_member
    }

    pub fn initial_state(&self, member_id: u64) -> JoinState {
        if self.should_bootstrap(member_id) {
            JoinState::BootstrappedSoloLeader
        } else {
            JoinState::AwaitingJoin
        }
    }
}

impl JoinState {
    /// State of a member whose stored configuration lists `voters`.
    pub fn recovered(member_id: u64, voters: &[u64]) -> JoinState {
        match voters {
            [] => JoinState::AwaitingJoin,
            [only] if *only == member_id => JoinState::BootstrappedSoloLeader,
            _ if voters.contains(&member_id) => JoinState::Member,
            _ => JoinState::Removed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

/// One row of the reported configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub id: u64,
    pub shard_id: u64,
    pub address: String,
    pub http_address: Option<String>,
    pub suffrage: Suffrage,
}

/// Member id to addressing metadata, replicated through conf-change contexts
/// and snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDirectory {
    members: BTreeMap<u64, MemberInfo>,
}

impl MemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u64, info: MemberInfo) {
        self.members.insert(id, info);
    }

    pub fn remove(&mut self, id: u64) -> Option<MemberInfo> {
        self.members.remove(&id)
    }

    pub fn raft_addr(&self, id: u64) -> Option<&str> {
        self.members.get(&id).map(|m| m.raft_addr.as_str())
    }

    pub fn http_addr(&self, id: u64) -> Option<&str> {
        self.members.get(&id).and_then(|m| m.http_addr.as_deref())
    }

    /// Joins the directory with the voter and learner sets Raft reports.
    ///
    /// Members Raft knows about but the directory does not (which should not
    /// happen once the conf change is applied) are listed with an empty
    /// address rather than hidden.
    pub fn configuration(&self, voters: &[u64], learners: &[u64]) -> Vec<ServerEntry> {
        let tagged = voters
            .iter()
            .map(|id| (*id, Suffrage::Voter))
            .chain(learners.iter().map(|id| (*id, Suffrage::Nonvoter)));
        let mut servers: Vec<ServerEntry> = tagged
            .map(|(id, suffrage)| {
                let info = self.members.get(&id);
                ServerEntry {
                    id,
                    shard_id: info.map(|m| m.shard_id).unwrap_or(id),
                    address: info.map(|m| m.raft_addr.clone()).unwrap_or_default(),
                    http_address: info.and_then(|m| m.http_addr.clone()),
                    suffrage,
                }
            })
            .collect();
        servers.sort_by_key(|s| s.id);
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(shard: u64, port: u16) -> MemberInfo {
        MemberInfo {
            shard_id: shard,
            raft_addr: format!("127.0.0.1:{port}"),
            http_addr: Some(format!("127.0.0.1:{}", port - 10000)),
        }
    }

    #[test]
    fn exactly_one_member_bootstraps() {
        let policy = BootstrapPolicy::new(1);
        let bootstrappers: Vec<u64> = (1..=5).filter(|id| policy.should_bootstrap(*id)).collect();
        assert_eq!(bootstrappers, vec![1]);
        assert_eq!(policy.initial_state(1), JoinState::BootstrappedSoloLeader);
        assert_eq!(policy.initial_state(2), JoinState::AwaitingJoin);
    }

    #[test]
    fn restart_resumes_from_stored_voters() {
        assert_eq!(JoinState::recovered(1, &[1]), JoinState::BootstrappedSoloLeader);
        assert_eq!(JoinState::recovered(2, &[1, 2, 3]), JoinState::Member);
        assert_eq!(JoinState::recovered(3, &[1, 2]), JoinState::Removed);
        assert_eq!(JoinState::recovered(4, &[]), JoinState::AwaitingJoin);
    }

    #[test]
    fn configuration_is_sorted_and_tagged() {
        let mut dir = MemberDirectory::new();
        dir.insert(3, info(3, 18031));
        dir.insert(1, info(1, 18011));
        dir.insert(7, info(7, 18071));

        let servers = dir.configuration(&[3, 1], &[7]);
        let ids: Vec<u64> = servers.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 3, 7]);
        assert_eq!(servers[0].suffrage, Suffrage::Voter);
        assert_eq!(servers[2].suffrage, Suffrage::Nonvoter);
        assert_eq!(servers[1].http_address.as_deref(), Some("127.0.0.1:8031"));
    }

    #[test]
    fn unknown_voter_is_still_listed() {
        let dir = MemberDirectory::new();
        let servers = dir.configuration(&[9], &[]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].address, "");
        assert_eq!(servers[0].shard_id, 9);
    }
}
