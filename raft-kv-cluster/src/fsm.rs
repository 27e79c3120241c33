//! In-memory key-value state machine driven by committed log entries.
//!
//! Every member owns one [`KvStateMachine`]. The consensus worker is the only
//! writer; HTTP status handlers and tests read concurrently, hence the
//! `RwLock`.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};

use crate::command::Operation;
use crate::error::ShardError;

/// Result of applying one operation: the stored, read or removed value.
pub type ApplyResult = std::result::Result<String, ShardError>;

/// Thread-safe key-value map replicated by Raft.
///
/// `BTreeMap` keeps iteration deterministic, so two members that applied the
/// same prefix produce byte-identical snapshots.
#[derive(Default)]
pub struct KvStateMachine {
    data: RwLock<BTreeMap<String, String>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a committed operation.
    ///
    /// GET and DEL on an absent key fail with [`ShardError::KeyNotFound`]
    /// and leave the map untouched.
    pub fn apply(&self, op: &Operation) -> ApplyResult {
        match op {
            Operation::Put { key, value } => {
                self.write().insert(key.clone(), value.clone());
                Ok(value.clone())
            }
            Operation::Get { key } => self.get(key).ok_or(ShardError::KeyNotFound),
            Operation::Delete { key } => self.write().remove(key).ok_or(ShardError::KeyNotFound),
        }
    }

    /// Local read of the applied state, without going through the log.
    pub fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Clones the whole map; used by status output and tests.
    pub fn contents(&self) -> BTreeMap<String, String> {
        self.read().clone()
    }

    /// Serializes the full map for a Raft snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(&*self.read()).context("serialize kv snapshot")
    }

    /// Replaces the map wholesale with the contents of a snapshot.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let restored: BTreeMap<String, String> =
            bincode::deserialize(bytes).context("deserialize kv snapshot")?;
        *self.write() = restored;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}
