//! Durable log store for the consensus engine.
//!
//! [`LogStore`] is the engine's `raft::Storage`. Everything is written to disk
//! and fsynced before the mutating call returns, so the driver can send
//! messages derived from an append as soon as the append returns.
//!
//! # On-disk layout
//!
//! - `wal` - log entries after the snapshot index, one frame per entry
//! - `hardstate` - term, vote and commit index
//! - `confstate` - current voter set
//! - `snapshot` - most recent snapshot (metadata plus state machine data)
//! - `members.json` - address book of the membership view
//!
//! A frame is `[len: u32 BE][crc32: u32 BE][protobuf bytes]`. Files other
//! than `wal` hold exactly one frame and are replaced atomically.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use tracing::{debug, warn};

const WAL_FILE: &str = "wal";
const HARD_STATE_FILE: &str = "hardstate";
const CONF_STATE_FILE: &str = "confstate";
const SNAPSHOT_FILE: &str = "snapshot";
const MEMBERS_FILE: &str = "members.json";

const FRAME_HEADER: usize = 8;

/// Shared handle to the on-disk log.
///
/// Cloning is cheap; the engine owns one clone and the driver keeps another
/// for writes, the same way `MemStorage` is used.
#[derive(Clone)]
pub struct LogStore {
    core: Arc<RwLock<LogStoreCore>>,
}

impl LogStore {
    /// Opens (or creates) the log store in `dir` and loads whatever is there.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let core = LogStoreCore::load(dir.as_ref().to_path_buf())?;
        Ok(Self {
            core: Arc::new(RwLock::new(core)),
        })
    }

    pub fn rl(&self) -> RwLockReadGuard<'_, LogStoreCore> {
        self.core.read()
    }

    pub fn wl(&self) -> RwLockWriteGuard<'_, LogStoreCore> {
        self.core.write()
    }
}

pub struct LogStoreCore {
    dir: PathBuf,
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    /// Entries after the snapshot index; `entries[i].index == snapshot_index + 1 + i`.
    entries: Vec<Entry>,
    fresh: bool,
}

impl LogStoreCore {
    fn load(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;

        let snapshot: Option<Snapshot> = read_record(&dir.join(SNAPSHOT_FILE))?;
        let hard_state: Option<HardState> = read_record(&dir.join(HARD_STATE_FILE))?;
        let conf_state: Option<ConfState> = read_record(&dir.join(CONF_STATE_FILE))?;
        let (wal, wal_complete) = read_wal(&dir.join(WAL_FILE))?;

        let fresh = snapshot.is_none() && hard_state.is_none() && conf_state.is_none() && wal.is_empty();
        let snapshot = snapshot.unwrap_or_default();
        let snapshot_index = snapshot.get_metadata().index;
        let conf_state = conf_state.unwrap_or_else(|| snapshot.get_metadata().get_conf_state().clone());

        // A crash between writing a snapshot and rewriting the WAL leaves
        // entries the snapshot already covers.
        let entries: Vec<Entry> = wal.into_iter().filter(|e| e.index > snapshot_index).collect();
        for (offset, entry) in entries.iter().enumerate() {
            let expected = snapshot_index + 1 + offset as u64;
            ensure!(
                entry.index == expected,
                "wal is not contiguous: found index {} where {} was expected",
                entry.index,
                expected
            );
        }

        debug!(
            dir = %dir.display(),
            snapshot_index,
            entries = entries.len(),
            fresh,
            "opened log store"
        );

        let core = Self {
            dir,
            hard_state: hard_state.unwrap_or_default(),
            conf_state,
            snapshot,
            entries,
            fresh,
        };
        // Later appends go after the torn bytes unless they are cut off now.
        if !wal_complete {
            core.rewrite_wal()?;
        }
        Ok(core)
    }

    /// True when nothing had been persisted before this store was opened.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    pub fn conf_state(&self) -> &ConfState {
        &self.conf_state
    }

    pub fn set_hard_state(&mut self, hard_state: HardState) -> Result<()> {
        write_record(&self.dir.join(HARD_STATE_FILE), &hard_state)?;
        self.hard_state = hard_state;
        Ok(())
    }

    pub fn set_commit(&mut self, commit: u64) -> Result<()> {
        let mut hard_state = self.hard_state.clone();
        hard_state.commit = commit;
        self.set_hard_state(hard_state)
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) -> Result<()> {
        write_record(&self.dir.join(CONF_STATE_FILE), &conf_state)?;
        self.conf_state = conf_state;
        self.fresh = false;
        Ok(())
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.get_metadata().index
    }

    pub fn first_index(&self) -> u64 {
        self.snapshot_index() + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index() + self.entries.len() as u64
    }

    pub fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.snapshot_index() {
            return Ok(self.snapshot.get_metadata().term);
        }
        if idx < self.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > self.last_index() {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        Ok(self.entries[(idx - self.first_index()) as usize].term)
    }

    /// Entries in `[lo, hi)`.
    pub fn read_range(&self, lo: u64, hi: u64) -> raft::Result<Vec<Entry>> {
        if lo < self.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if hi > self.last_index() + 1 || lo > hi {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        let offset = self.first_index();
        Ok(self.entries[(lo - offset) as usize..(hi - offset) as usize].to_vec())
    }

    /// Appends entries, replacing any existing suffix they conflict with.
    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };

        // Anything at or below the snapshot index is already folded in.
        let skip = self.first_index().saturating_sub(first.index) as usize;
        if skip >= entries.len() {
            return Ok(());
        }
        let entries = &entries[skip..];
        let start = entries[0].index;
        ensure!(
            start <= self.last_index() + 1,
            "log gap: cannot append index {} after {}",
            start,
            self.last_index()
        );

        if start <= self.last_index() {
            let keep = (start - self.first_index()) as usize;
            debug!(from = start, dropped = self.entries.len() - keep, "truncating conflicting log suffix");
            self.entries.truncate(keep);
            self.entries.extend_from_slice(entries);
            self.rewrite_wal()?;
        } else {
            self.entries.extend_from_slice(entries);
            append_wal(&self.dir.join(WAL_FILE), entries)?;
        }
        self.fresh = false;
        Ok(())
    }

    /// Latest snapshot, if one has been taken or received.
    pub fn load_snapshot(&self) -> Option<&Snapshot> {
        if self.snapshot.is_empty() {
            None
        } else {
            Some(&self.snapshot)
        }
    }

    /// Stores a locally taken snapshot and drops every entry it covers.
    pub fn save_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        ensure!(
            index > self.snapshot_index(),
            "snapshot at {} is not newer than {}",
            index,
            self.snapshot_index()
        );
        ensure!(
            index <= self.last_index(),
            "snapshot at {} is past the end of the log ({})",
            index,
            self.last_index()
        );

        write_record(&self.dir.join(SNAPSHOT_FILE), &snapshot)?;
        let drop = (index - self.snapshot_index()) as usize;
        self.entries.drain(..drop);
        self.snapshot = snapshot;
        self.rewrite_wal()?;
        Ok(())
    }

    /// Installs a snapshot received from the leader, replacing the whole log.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let (index, term) = (meta.index, meta.term);
        if index <= self.snapshot_index() {
            bail!(raft::Error::Store(StorageError::SnapshotOutOfDate));
        }

        write_record(&self.dir.join(SNAPSHOT_FILE), &snapshot)?;
        self.entries.clear();
        self.rewrite_wal()?;

        self.set_conf_state(meta.get_conf_state().clone())?;
        let mut hard_state = self.hard_state.clone();
        hard_state.term = hard_state.term.max(term);
        hard_state.commit = hard_state.commit.max(index);
        self.set_hard_state(hard_state)?;

        self.snapshot = snapshot;
        Ok(())
    }

    pub fn save_members(&self, members: &BTreeMap<u64, String>) -> Result<()> {
        let json = serde_json::to_vec_pretty(members).context("failed to encode members")?;
        write_atomic(&self.dir.join(MEMBERS_FILE), &json)
    }

    pub fn load_members(&self) -> Result<Option<BTreeMap<u64, String>>> {
        let path = self.dir.join(MEMBERS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let members = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt members file {}", path.display()))?;
        Ok(Some(members))
    }

    fn rewrite_wal(&self) -> Result<()> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            encode_frame(&mut buf, &entry.encode_to_vec());
        }
        write_atomic(&self.dir.join(WAL_FILE), &buf)
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.rl();
        Ok(RaftState::new(core.hard_state.clone(), core.conf_state.clone()))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let mut entries = self.rl().read_range(low, high)?;
        if let Some(max_size) = max_size.into() {
            let mut size = 0u64;
            let limit = entries
                .iter()
                .position(|entry| {
                    size += entry.encoded_len() as u64;
                    size > max_size
                })
                .unwrap_or(entries.len())
                .max(1);
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.rl().term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.rl();
        match core.load_snapshot() {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot.clone()),
            _ => Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)),
        }
    }
}

fn encode_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Splits a buffer into frames. The second value is false when the buffer
/// ends in a torn (incomplete or mismatched) final frame.
fn decode_frames(bytes: &[u8]) -> Result<(Vec<&[u8]>, bool)> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes.len() - pos < FRAME_HEADER {
            return Ok((frames, false));
        }
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into()?) as usize;
        let crc = u32::from_be_bytes(bytes[pos + 4..pos + 8].try_into()?);
        let end = pos + FRAME_HEADER + len;
        if end > bytes.len() {
            return Ok((frames, false));
        }
        let payload = &bytes[pos + FRAME_HEADER..end];
        if crc32fast::hash(payload) != crc {
            if end == bytes.len() {
                return Ok((frames, false));
            }
            bail!("checksum mismatch in frame at offset {pos}");
        }
        frames.push(payload);
        pos = end;
    }
    Ok((frames, true))
}

/// Reads every complete frame. The flag is false when a torn tail was dropped.
fn read_wal(path: &Path) -> Result<(Vec<Entry>, bool)> {
    if !path.exists() {
        return Ok((Vec::new(), true));
    }
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (frames, complete) =
        decode_frames(&bytes).with_context(|| format!("corrupt wal {}", path.display()))?;
    if !complete {
        warn!(path = %path.display(), "ignoring torn frame at the end of the wal");
    }
    let entries = frames
        .into_iter()
        .map(|frame| Entry::decode(frame).context("invalid wal entry"))
        .collect::<Result<Vec<_>>>()?;
    Ok((entries, complete))
}

fn append_wal(path: &Path, entries: &[Entry]) -> Result<()> {
    let mut buf = Vec::new();
    for entry in entries {
        encode_frame(&mut buf, &entry.encode_to_vec());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

fn read_record<T: ProstMessage + Default>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (frames, complete) = decode_frames(&bytes)?;
    match (frames.as_slice(), complete) {
        ([frame], true) => Ok(Some(
            T::decode(*frame).with_context(|| format!("invalid record in {}", path.display()))?,
        )),
        _ => bail!("corrupt record file {}", path.display()),
    }
}

fn write_record<T: ProstMessage>(path: &Path, record: &T) -> Result<()> {
    let mut buf = Vec::new();
    encode_frame(&mut buf, &record.encode_to_vec());
    write_atomic(path, &buf)
}

/// Write to a temp file, fsync, then rename over the target.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file =
        File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
