//! On-disk copy of a member's Raft state.
//!
//! A store directory holds four files:
//!
//! - `raft.log`: log entries, each framed as a big-endian `u32` length
//!   followed by the protobuf-encoded `Entry`
//! - `hard_state` and `conf_state`: the latest protobuf `HardState` and `ConfState`
//! - `snapshot`: the latest protobuf `Snapshot`, state machine image included
//!
//! Small files are replaced atomically (write `.tmp`, fsync, rename). The log
//! is appended in place, and a frame cut short by a crash is dropped on open.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use tracing::warn;

const LOG_FILE: &str = "raft.log";
const HARD_STATE_FILE: &str = "hard_state";
const CONF_STATE_FILE: &str = "conf_state";
const SNAPSHOT_FILE: &str = "snapshot";

/// Everything found in a store directory when it was opened.
#[derive(Debug, Default)]
pub struct Recovered {
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<Entry>,
    pub hard_state: Option<HardState>,
    pub conf_state: Option<ConfState>,
}

impl Recovered {
    /// True when the directory has never held Raft state.
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none()
            && self.entries.is_empty()
            && self.hard_state.is_none()
            && self.conf_state.is_none()
    }
}

pub struct DiskLog {
    dir: PathBuf,
    log: File,
    last_index: u64,
}

impl DiskLog {
    /// Opens (creating if needed) the store at `dir` and reads back what it holds.
    pub fn open(dir: &Path) -> Result<(Self, Recovered)> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create store dir {}", dir.display()))?;

        let snapshot = read_message(&dir.join(SNAPSHOT_FILE))?;
        let hard_state = read_message(&dir.join(HARD_STATE_FILE))?;
        let conf_state = read_message(&dir.join(CONF_STATE_FILE))?;

        let log_path = dir.join(LOG_FILE);
        let (entries, valid_len) = read_log(&log_path)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open {}", log_path.display()))?;
        let file_len = log.metadata().context("stat raft log")?.len();
        if file_len > valid_len {
            warn!(
                path = %log_path.display(),
                dropped = file_len - valid_len,
                "truncating torn tail of raft log"
            );
            log.set_len(valid_len).context("truncate raft log")?;
        }

        let last_index = entries.last().map_or(0, |e| e.index);
        let disk = Self {
            dir: dir.to_path_buf(),
            log,
            last_index,
        };
        let recovered = Recovered {
            snapshot,
            entries,
            hard_state,
            conf_state,
        };
        Ok((disk, recovered))
    }

    /// Index of the last entry in the log file, or 0 when it is empty.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        self.log
            .write_all(&encode_frames(entries))
            .context("append to raft log")?;
        self.log.sync_data().context("sync raft log")?;
        self.last_index = last.index;
        Ok(())
    }

    /// Replaces the whole log file with `entries`.
    pub fn rewrite(&mut self, entries: &[Entry]) -> Result<()> {
        write_atomic(&self.dir, LOG_FILE, &encode_frames(entries))?;
        let path = self.dir.join(LOG_FILE);
        self.log = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("reopen {}", path.display()))?;
        self.last_index = entries.last().map_or(0, |e| e.index);
        Ok(())
    }

    pub fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        write_atomic(&self.dir, HARD_STATE_FILE, &hard_state.encode_to_vec())
    }

    pub fn save_conf_state(&self, conf_state: &ConfState) -> Result<()> {
        write_atomic(&self.dir, CONF_STATE_FILE, &conf_state.encode_to_vec())
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        write_atomic(&self.dir, SNAPSHOT_FILE, &snapshot.encode_to_vec())
    }
}

fn encode_frames(entries: &[Entry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        let bytes = entry.encode_to_vec();
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(&bytes);
    }
    buf
}

/// Decodes every complete frame and returns the entries together with the
/// byte length they occupy.
fn read_log(path: &Path) -> Result<(Vec<Entry>, u64)> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };

    let mut entries = Vec::new();
    let mut pos = 0;
    while pos + 4 <= bytes.len() {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[pos..pos + 4]);
        let end = pos + 4 + u32::from_be_bytes(len_buf) as usize;
        if end > bytes.len() {
            break;
        }
        match Entry::decode(&bytes[pos + 4..end]) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                warn!(path = %path.display(), offset = pos, "undecodable log frame: {err}");
                break;
            }
        }
        pos = end;
    }
    Ok((entries, pos as u64))
}

fn read_message<M: ProstMessage + Default>(path: &Path) -> Result<Option<M>> {
    match fs::read(path) {
        Ok(bytes) => M::decode(&bytes[..])
            .map(Some)
            .with_context(|| format!("decode {}", path.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, dir.join(name)).with_context(|| format!("replace {name}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry.data = format!("payload-{index}").into_bytes().into();
        entry
    }

    #[test]
    fn fresh_directory_recovers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (disk, recovered) = DiskLog::open(dir.path()).unwrap();
        assert!(recovered.is_empty());
        assert_eq!(disk.last_index(), 0);
    }

    #[test]
    fn appended_entries_and_state_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut disk, _) = DiskLog::open(dir.path()).unwrap();
            disk.append(&[entry(2, 1), entry(3, 1)]).unwrap();
            disk.append(&[entry(4, 2)]).unwrap();
            let mut hs = HardState::default();
            hs.term = 2;
            hs.vote = 1;
            hs.commit = 3;
            disk.save_hard_state(&hs).unwrap();
            disk.save_conf_state(&ConfState::from((vec![1, 2], vec![]))).unwrap();
        }

        let (disk, recovered) = DiskLog::open(dir.path()).unwrap();
        let indexes: Vec<u64> = recovered.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![2, 3, 4]);
        assert_eq!(recovered.entries[2].term, 2);
        assert_eq!(disk.last_index(), 4);
        let hs = recovered.hard_state.unwrap();
        assert_eq!((hs.term, hs.vote, hs.commit), (2, 1, 3));
        assert_eq!(recovered.conf_state.unwrap().voters, vec![1, 2]);
        assert!(recovered.snapshot.is_none());
    }

    #[test]
    fn torn_frame_is_dropped_and_log_stays_appendable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut disk, _) = DiskLog::open(dir.path()).unwrap();
            disk.append(&[entry(2, 1), entry(3, 1)]).unwrap();
        }
        // A crash halfway through the next frame.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        let frame = encode_frames(&[entry(4, 1)]);
        file.write_all(&frame[..frame.len() - 3]).unwrap();
        drop(file);

        let (mut disk, recovered) = DiskLog::open(dir.path()).unwrap();
        assert_eq!(recovered.entries.len(), 2);
        assert_eq!(disk.last_index(), 3);
        disk.append(&[entry(4, 2)]).unwrap();

        let (_, recovered) = DiskLog::open(dir.path()).unwrap();
        let last = recovered.entries.last().unwrap();
        assert_eq!((last.index, last.term), (4, 2));
    }

    #[test]
    fn rewrite_replaces_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let (mut disk, _) = DiskLog::open(dir.path()).unwrap();
        disk.append(&[entry(2, 1), entry(3, 1), entry(4, 1)]).unwrap();
        disk.rewrite(&[entry(2, 1), entry(3, 2)]).unwrap();
        assert_eq!(disk.last_index(), 3);
        disk.append(&[entry(4, 2)]).unwrap();

        let (_, recovered) = DiskLog::open(dir.path()).unwrap();
        let terms: Vec<u64> = recovered.entries.iter().map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 2, 2]);
    }
}
