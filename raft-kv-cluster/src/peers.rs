//! Per-node map of shard id to the HTTP address of that shard's leader.
//!
//! Local and best-effort: it is never replicated and any entry may be stale.
//! Updates merge by term so that an old announcement arriving late cannot
//! overwrite a newer one. The map holds at most [`MAX_KNOWN_SHARDS`] entries;
//! announcements for further unknown shards are refused.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::PeerView;

pub const MAX_KNOWN_SHARDS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub address: String,
    pub term: u64,
    pub updated_at: SystemTime,
}

/// Result of merging one announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// Lower term than the stored entry; ignored.
    Stale,
    /// Unknown shard while the map is at capacity; ignored.
    Full,
}

impl MergeOutcome {
    /// Whether the announcement should be passed on to other peers.
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Updated)
    }
}

pub struct KnownPeers {
    self_shard: u64,
    capacity: usize,
    entries: RwLock<BTreeMap<u64, PeerEntry>>,
}

impl KnownPeers {
    pub fn new(self_shard: u64) -> Self {
        Self::with_capacity(self_shard, MAX_KNOWN_SHARDS)
    }

    pub fn with_capacity(self_shard: u64, capacity: usize) -> Self {
        Self {
            self_shard,
            capacity,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seeds statically configured peers at term 0.
    pub fn with_seeds(self_shard: u64, seeds: impl IntoIterator<Item = (u64, String)>) -> Self {
        let peers = Self::new(self_shard);
        for (shard, address) in seeds {
            peers.merge(shard, address, Some(0));
        }
        peers
    }

    /// Merges `{shard, address, term}`. Without a term the stored term (or 0)
    /// is assumed, which makes manual re-announcements idempotent.
    pub fn merge(&self, shard: u64, address: String, term: Option<u64>) -> MergeOutcome {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let now = SystemTime::now();
        let full = entries.len() >= self.capacity;
        match entries.get_mut(&shard) {
            None if full => MergeOutcome::Full,
            None => {
                entries.insert(
                    shard,
                    PeerEntry {
                        address,
                        term: term.unwrap_or(0),
                        updated_at: now,
                    },
                );
                MergeOutcome::Inserted
            }
            Some(entry) => {
                let term = term.unwrap_or(entry.term);
                if term < entry.term {
                    MergeOutcome::Stale
                } else if term == entry.term && address == entry.address {
                    MergeOutcome::Unchanged
                } else {
                    entry.address = address;
                    entry.term = term;
                    entry.updated_at = now;
                    MergeOutcome::Updated
                }
            }
        }
    }

    pub fn get(&self, shard: u64) -> Option<PeerEntry> {
        self.read().get(&shard).cloned()
    }

    /// Where to send an announcement: every known peer except this node's
    /// own shard and `exclude`.
    pub fn broadcast_targets(&self, exclude: u64) -> Vec<(u64, String)> {
        self.read()
            .iter()
            .filter(|(shard, _)| **shard != self.self_shard && **shard != exclude)
            .map(|(shard, entry)| (*shard, entry.address.clone()))
            .collect()
    }

    pub fn addresses(&self) -> BTreeMap<u64, String> {
        self.read()
            .iter()
            .map(|(shard, entry)| (*shard, entry.address.clone()))
            .collect()
    }

    pub fn views(&self) -> BTreeMap<u64, PeerView> {
        self.read()
            .iter()
            .map(|(shard, entry)| {
                let updated_at_ms = entry
                    .updated_at
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                (
                    *shard,
                    PeerView {
                        address: entry.address.clone(),
                        term: entry.term,
                        updated_at_ms,
                    },
                )
            })
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u64, PeerEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_follows_term_order() {
        let peers = KnownPeers::new(1);
        assert_eq!(peers.merge(2, "shard2:8021".into(), Some(3)), MergeOutcome::Inserted);
        assert_eq!(peers.merge(2, "shard2:8021".into(), Some(3)), MergeOutcome::Unchanged);
        assert_eq!(peers.merge(2, "shard3:8031".into(), Some(2)), MergeOutcome::Stale);
        assert_eq!(peers.get(2).unwrap().address, "shard2:8021");

        assert_eq!(peers.merge(2, "shard3:8031".into(), Some(4)), MergeOutcome::Updated);
        let entry = peers.get(2).unwrap();
        assert_eq!((entry.address.as_str(), entry.term), ("shard3:8031", 4));
    }

    #[test]
    fn termless_announcement_keeps_stored_term() {
        let peers = KnownPeers::with_seeds(1, [(2, "shard2:8021".to_string())]);
        peers.merge(2, "shard2:8021".into(), Some(5));

        assert_eq!(peers.merge(2, "shard2:8021".into(), None), MergeOutcome::Unchanged);
        assert_eq!(peers.merge(2, "other:8021".into(), None), MergeOutcome::Updated);
        assert_eq!(peers.get(2).unwrap().term, 5);
    }

    #[test]
    fn unknown_shards_are_refused_once_full() {
        let peers = KnownPeers::with_capacity(1, 2);
        assert_eq!(peers.merge(2, "shard2:8021".into(), Some(1)), MergeOutcome::Inserted);
        assert_eq!(peers.merge(3, "shard3:8031".into(), Some(1)), MergeOutcome::Inserted);
        assert_eq!(peers.merge(4, "shard4:8041".into(), Some(1)), MergeOutcome::Full);
        assert!(!MergeOutcome::Full.changed());
        assert!(peers.get(4).is_none());

        // Known shards still take newer leaders.
        assert_eq!(peers.merge(3, "other:8031".into(), Some(2)), MergeOutcome::Updated);
        assert_eq!(peers.views().len(), 2);
    }

    #[test]
    fn broadcast_targets_skip_self_and_subject() {
        let peers = KnownPeers::with_seeds(
            1,
            [
                (1, "shard1:8011".to_string()),
                (2, "shard2:8021".to_string()),
                (3, "shard3:8031".to_string()),
            ],
        );
        let targets = peers.broadcast_targets(3);
        assert_eq!(targets, vec![(2, "shard2:8021".to_string())]);
        assert_eq!(peers.views().len(), 3);
    }
}
