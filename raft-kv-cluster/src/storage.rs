//! Raft log storage with state-carrying snapshots.
//!
//! `MemStorage` keeps the log, hard state and conf state but produces
//! snapshots with metadata only. [`ShardStorage`] wraps it and fills the
//! snapshot payload with the full key-value map and member directory, so a
//! member that catches up by snapshot (a fresh joiner, or a follower behind a
//! compacted log) ends up with real state instead of an empty map.
//!
//! Opened with a store directory, every change to the log, hard state, conf
//! state or snapshot is also written through to a [`DiskLog`] before Raft is
//! told it is persisted, and [`ShardStorage::open`] rebuilds the in-memory
//! copy from disk after a restart.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{Context, Result, bail};
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage};
use raft::{RaftState, Storage, StorageError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::MemberInfo;
use crate::disk::DiskLog;
use crate::fsm::KvStateMachine;
use crate::membership::MemberDirectory;

/// Log position of the bootstrap snapshot. Starting the log after index 1
/// forces every joiner to receive a snapshot, which is how it learns the
/// initial configuration.
pub const BOOTSTRAP_INDEX: u64 = 1;
pub const BOOTSTRAP_TERM: u64 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    kv: Vec<u8>,
    members: MemberDirectory,
}

#[derive(Clone)]
pub struct ShardStorage {
    mem: MemStorage,
    fsm: Arc<KvStateMachine>,
    members: Arc<RwLock<MemberDirectory>>,
    disk: Option<Arc<Mutex<DiskLog>>>,
    restored: bool,
}

impl ShardStorage {
    /// Storage that lives in memory only.
    pub fn new(fsm: Arc<KvStateMachine>, members: Arc<RwLock<MemberDirectory>>) -> Self {
        Self {
            mem: MemStorage::new(),
            fsm,
            members,
            disk: None,
            restored: false,
        }
    }

    /// Storage backed by `dir`, reloaded from whatever the directory holds.
    ///
    /// The state machine and directory are restored from the stored snapshot;
    /// entries after it are replayed by Raft as committed entries.
    pub fn open(
        dir: &Path,
        fsm: Arc<KvStateMachine>,
        members: Arc<RwLock<MemberDirectory>>,
    ) -> Result<Self> {
        let (disk, recovered) = DiskLog::open(dir)?;
        let restored = !recovered.is_empty();
        let storage = Self {
            mem: MemStorage::new(),
            fsm,
            members,
            disk: Some(Arc::new(Mutex::new(disk))),
            restored,
        };

        if let Some(snapshot) = recovered.snapshot {
            storage.restore(decode_image(&snapshot)?)?;
            storage
                .mem
                .wl()
                .apply_snapshot(snapshot)
                .context("apply stored snapshot")?;
        }

        let next = storage.mem.last_index()? + 1;
        let entries: Vec<Entry> = recovered
            .entries
            .into_iter()
            .filter(|e| e.index >= next)
            .collect();
        if let Some(first) = entries.first() {
            if first.index != next {
                bail!(
                    "stored log resumes at {} but the snapshot ends at {}",
                    first.index,
                    next - 1
                );
            }
            storage
                .mem
                .wl()
                .append(&entries)
                .context("replay stored log")?;
        }

        if let Some(conf_state) = recovered.conf_state {
            storage.mem.wl().set_conf_state(conf_state);
        }
        if let Some(mut hard_state) = recovered.hard_state {
            // A snapshot can land on disk just before the hard state that commits it.
            let snapshot_index = storage.mem.first_index()? - 1;
            hard_state.commit = hard_state.commit.max(snapshot_index);
            storage.mem.wl().set_hardstate(hard_state);
        }

        if restored {
            let state = storage.mem.initial_state()?;
            info!(
                dir = %dir.display(),
                first_index = storage.mem.first_index()?,
                last_index = storage.mem.last_index()?,
                term = state.hard_state.term,
                commit = state.hard_state.commit,
                voters = ?state.conf_state.voters,
                "recovered raft state from disk"
            );
        }
        Ok(storage)
    }

    /// True when this storage was reloaded from a directory that already held
    /// Raft state, in which case the member must not bootstrap again.
    pub fn restored(&self) -> bool {
        self.restored
    }

    pub fn fsm(&self) -> &Arc<KvStateMachine> {
        &self.fsm
    }

    pub fn members(&self) -> &Arc<RwLock<MemberDirectory>> {
        &self.members
    }

    /// Installs the one-member group this node will lead.
    pub fn bootstrap(&self, id: u64, info: MemberInfo) -> Result<()> {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, info);

        let mut snapshot = Snapshot::default();
        snapshot.data = self.image()?.into();
        let meta = snapshot.mut_metadata();
        meta.index = BOOTSTRAP_INDEX;
        meta.term = BOOTSTRAP_TERM;
        meta.set_conf_state(ConfState::from((vec![id], vec![])));

        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .context("install bootstrap snapshot")?;
        self.persist_snapshot(&snapshot)
    }

    /// Applies a snapshot received from the leader to the log and restores
    /// the state machine and directory from its payload.
    pub fn install(&self, snapshot: &Snapshot) -> Result<()> {
        let image = decode_image(snapshot)?;
        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .context("apply snapshot to log")?;
        self.restore(image)?;
        self.persist_snapshot(snapshot)
    }

    /// Discards log entries before `index`. The entry at `index` is kept so
    /// its term stays available for the next snapshot's metadata.
    ///
    /// On disk the discarded prefix is replaced by a snapshot of the state
    /// machine, which must already be applied up to `index`.
    pub fn compact(&self, index: u64) -> Result<()> {
        if let Some(disk) = &self.disk {
            let mut snapshot = Snapshot::default();
            snapshot.data = self.image()?.into();
            let meta = snapshot.mut_metadata();
            meta.index = index;
            meta.term = self.mem.term(index)?;
            meta.set_conf_state(self.mem.initial_state()?.conf_state);
            lock(disk).save_snapshot(&snapshot)?;
        }

        self.mem
            .wl()
            .compact(index)
            .with_context(|| format!("compact log to {index}"))?;

        if let Some(disk) = &self.disk {
            let remaining = self.log_entries()?;
            lock(disk).rewrite(&remaining)?;
        }
        Ok(())
    }

    /// Appends entries from a ready, replacing any conflicting suffix.
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        self.mem
            .wl()
            .append(entries)
            .context("append entries to log")?;

        if let Some(disk) = &self.disk {
            let mut disk = lock(disk);
            if first.index <= disk.last_index() {
                let all = self.log_entries()?;
                disk.rewrite(&all)?;
            } else {
                disk.append(entries)?;
            }
        }
        Ok(())
    }

    pub fn set_hard_state(&self, hard_state: HardState) -> Result<()> {
        if let Some(disk) = &self.disk {
            lock(disk).save_hard_state(&hard_state)?;
        }
        self.mem.wl().set_hardstate(hard_state);
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        self.mem.wl().mut_hard_state().set_commit(commit);
        if let Some(disk) = &self.disk {
            lock(disk).save_hard_state(&self.mem.initial_state()?.hard_state)?;
        }
        Ok(())
    }

    pub fn set_conf_state(&self, conf_state: ConfState) -> Result<()> {
        if let Some(disk) = &self.disk {
            lock(disk).save_conf_state(&conf_state)?;
        }
        self.mem.wl().set_conf_state(conf_state);
        Ok(())
    }

    /// Writes a freshly installed snapshot and the state it implies. The
    /// snapshot supersedes every stored entry.
    fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(disk) = &self.disk else {
            return Ok(());
        };
        let state = self.mem.initial_state()?;
        let mut disk = lock(disk);
        disk.save_snapshot(snapshot)?;
        disk.rewrite(&[])?;
        disk.save_conf_state(&state.conf_state)?;
        disk.save_hard_state(&state.hard_state)
    }

    fn restore(&self, image: SnapshotImage) -> Result<()> {
        self.fsm.restore(&image.kv)?;
        *self.members.write().unwrap_or_else(PoisonError::into_inner) = image.members;
        Ok(())
    }

    /// Every entry currently held in memory.
    fn log_entries(&self) -> Result<Vec<Entry>> {
        let low = self.mem.first_index()?;
        let high = self.mem.last_index()? + 1;
        if low >= high {
            return Ok(Vec::new());
        }
        Ok(self
            .mem
            .entries(low, high, None, GetEntriesContext::empty(false))?)
    }

    fn image(&self) -> Result<Vec<u8>> {
        let image = SnapshotImage {
            kv: self.fsm.snapshot()?,
            members: self
                .members
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        bincode::serialize(&image).context("encode snapshot image")
    }
}

fn decode_image(snapshot: &Snapshot) -> Result<SnapshotImage> {
    bincode::deserialize(&snapshot.data[..]).context("decode snapshot image")
}

fn lock(disk: &Mutex<DiskLog>) -> MutexGuard<'_, DiskLog> {
    disk.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Storage for ShardStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    /// `MemStorage` stamps the metadata with the hard state's commit index.
    /// The worker applies every committed entry before it steps Raft again,
    /// so the state machine is exactly at that index when this runs.
    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let mut snapshot = self.mem.snapshot(request_index, to)?;
        let image = self
            .image()
            .map_err(|err| raft::Error::Store(StorageError::Other(err.into())))?;
        snapshot.data = image.into();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Operation;

    fn storage() -> (ShardStorage, Arc<KvStateMachine>, Arc<RwLock<MemberDirectory>>) {
        let fsm = Arc::new(KvStateMachine::new());
        let members = Arc::new(RwLock::new(MemberDirectory::new()));
        (ShardStorage::new(fsm.clone(), members.clone()), fsm, members)
    }

    fn member(id: u64) -> MemberInfo {
        MemberInfo {
            shard_id: id,
            raft_addr: format!("127.0.0.1:1800{id}"),
            http_addr: Some(format!("127.0.0.1:800{id}")),
        }
    }

    #[test]
    fn bootstrap_starts_log_after_initial_snapshot() {
        let (storage, _, _) = storage();
        storage.bootstrap(1, member(1)).unwrap();

        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![1]);
        assert_eq!(storage.first_index().unwrap(), BOOTSTRAP_INDEX + 1);
    }

    #[test]
    fn snapshot_carries_state_to_a_fresh_member() {
        let (leader, leader_fsm, _) = storage();
        leader.bootstrap(1, member(1)).unwrap();
        leader_fsm
            .apply(&Operation::Put {
                key: "user1".into(),
                value: "john_doe".into(),
            })
            .unwrap();

        let snapshot = leader.snapshot(0, 2).unwrap();

        let (joiner, joiner_fsm, joiner_members) = storage();
        joiner.install(&snapshot).unwrap();

        assert_eq!(joiner_fsm.get("user1").as_deref(), Some("john_doe"));
        assert_eq!(
            joiner_members.read().unwrap().raft_addr(1),
            Some("127.0.0.1:18001")
        );
        assert_eq!(joiner.initial_state().unwrap().conf_state.voters, vec![1]);
    }

    fn open(dir: &Path) -> (ShardStorage, Arc<KvStateMachine>) {
        let fsm = Arc::new(KvStateMachine::new());
        let members = Arc::new(RwLock::new(MemberDirectory::new()));
        (ShardStorage::open(dir, fsm.clone(), members).unwrap(), fsm)
    }

    fn entry(index: u64, term: u64) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry
    }

    #[test]
    fn reopened_store_keeps_configuration_log_and_hard_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (storage, _) = open(dir.path());
            assert!(!storage.restored());
            storage.bootstrap(1, member(1)).unwrap();
            storage.append(&[entry(2, 1), entry(3, 2)]).unwrap();
            let mut hs = HardState::default();
            hs.term = 2;
            hs.vote = 1;
            storage.set_hard_state(hs).unwrap();
            storage.set_commit(3).unwrap();
            storage
                .set_conf_state(ConfState::from((vec![1, 2], vec![])))
                .unwrap();
        }

        let (storage, _) = open(dir.path());
        assert!(storage.restored());
        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![1, 2]);
        assert_eq!(
            (state.hard_state.term, state.hard_state.vote, state.hard_state.commit),
            (2, 1, 3)
        );
        assert_eq!(storage.first_index().unwrap(), BOOTSTRAP_INDEX + 1);
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.term(3).unwrap(), 2);
        assert_eq!(
            storage.members().read().unwrap().raft_addr(1),
            Some("127.0.0.1:18001")
        );
    }

    #[test]
    fn conflicting_suffix_is_replaced_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (storage, _) = open(dir.path());
            storage.bootstrap(1, member(1)).unwrap();
            storage
                .append(&[entry(2, 1), entry(3, 1), entry(4, 1)])
                .unwrap();
            storage.append(&[entry(3, 2)]).unwrap();
        }

        let (storage, _) = open(dir.path());
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.term(3).unwrap(), 2);
    }

    #[test]
    fn compaction_stores_state_machine_image() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (storage, fsm) = open(dir.path());
            storage.bootstrap(1, member(1)).unwrap();
            storage
                .append(&[entry(2, 1), entry(3, 1), entry(4, 1)])
                .unwrap();
            storage.set_commit(4).unwrap();
            fsm.apply(&Operation::Put {
                key: "user1".into(),
                value: "john_doe".into(),
            })
            .unwrap();
            storage.compact(3).unwrap();
        }

        let (storage, fsm) = open(dir.path());
        assert_eq!(fsm.get("user1").as_deref(), Some("john_doe"));
        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.last_index().unwrap(), 4);
        assert_eq!(storage.initial_state().unwrap().hard_state.commit, 4);
    }

    #[test]
    fn in_memory_storage_is_never_restored() {
        let (storage, _, _) = storage();
        storage.bootstrap(1, member(1)).unwrap();
        storage.append(&[entry(2, 1)]).unwrap();
        assert!(!storage.restored());
        assert_eq!(storage.last_index().unwrap(), 2);
    }
}
