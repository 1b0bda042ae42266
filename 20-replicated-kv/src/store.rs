//! Replicated state machine: the key-value map Raft keeps consistent.
//!
//! Only the applier thread mutates the map, by applying [`CommitBatch`]es in
//! the order the driver publishes them. Everyone else reads under a shared
//! lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::command::{CommandPayload, CommitBatch, EntryPayload, StateSnapshot};
use crate::runtime::{Proposer, SnapshotSource};

#[derive(Default)]
struct StoreState {
    map: BTreeMap<String, String>,
    last_applied: u64,
}

/// Thread-safe key-value store fed by the commit stream.
///
/// BTreeMap keeps iteration (and therefore snapshot bytes) deterministic.
///
/// # Why RwLock instead of Mutex?
///
/// There is one writer (the applier) and many readers: every Get, every
/// Put's previous-value lookup and the driver taking a snapshot. Readers
/// only contend with each other under a Mutex, and a snapshot that
/// serializes the whole map would stall all of them.
#[derive(Clone)]
pub struct KvStore {
    state: Arc<RwLock<StoreState>>,
    proposer: Proposer,
}

impl KvStore {
    pub fn new(proposer: Proposer) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            proposer,
        }
    }

    /// Hands a write to the driver and returns without touching the map.
    ///
    /// If the driver has stopped, the write is dropped.
    pub fn propose(&self, key: &str, value: &str) -> Result<()> {
        let data = CommandPayload::put(key, value)
            .encode()
            .context("encode command failed")?;
        if !self.proposer.propose(data) {
            debug!(key, "driver stopped, dropping proposal");
        }
        Ok(())
    }

    /// Applies one batch.
    ///
    /// Entries at or below `last_applied` are skipped, so replaying a batch
    /// is harmless. Undecodable commands are logged and skipped. A snapshot
    /// batch replaces the whole map.
    pub fn apply(&self, batch: CommitBatch) -> Result<()> {
        match batch {
            CommitBatch::Snapshot(snapshot) => self.restore(&snapshot),
            CommitBatch::Entries(entries) => {
                let mut state = self.state.write();
                for entry in entries {
                    if entry.index <= state.last_applied {
                        continue;
                    }
                    if let EntryPayload::Command(data) = &entry.payload {
                        match CommandPayload::decode(data) {
                            Ok(CommandPayload::Put { key, value }) => {
                                state.map.insert(key, value);
                            }
                            Err(err) => {
                                warn!(index = entry.index, error = %err, "skipping malformed entry");
                            }
                        }
                    }
                    state.last_applied = entry.index;
                }
                Ok(())
            }
        }
    }

    /// Replaces the map with a snapshot's contents.
    pub fn restore(&self, snapshot: &StateSnapshot) -> Result<()> {
        let map: BTreeMap<String, String> = if snapshot.state.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(&snapshot.state).context("invalid state snapshot")?
        };
        let mut state = self.state.write();
        state.map = map;
        state.last_applied = snapshot.index;
        debug!(index = snapshot.index, keys = state.map.len(), "restored state snapshot");
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.state.read().map.get(key).cloned()
    }

    pub fn last_applied(&self) -> u64 {
        self.state.read().last_applied
    }

    /// Point-in-time copy of the map, tagged with `last_applied`.
    pub fn snapshot(&self) -> Result<StateSnapshot> {
        let state = self.state.read();
        Ok(StateSnapshot {
            index: state.last_applied,
            state: serde_json::to_vec(&state.map).context("encode state snapshot failed")?,
        })
    }

    /// Copy of every key-value pair.
    pub fn contents(&self) -> BTreeMap<String, String> {
        self.state.read().map.clone()
    }

    /// Spawns the thread that applies commit batches until the driver
    /// closes the channel.
    ///
    /// A batch that cannot be applied leaves the map behind the log for
    /// good, so the applier stops and hands the error to `on_failure`
    /// (normally [`NodeHandle::abort`](crate::runtime::NodeHandle::abort)).
    pub fn spawn_applier<F>(&self, node_id: u64, commits: Receiver<CommitBatch>, on_failure: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce(anyhow::Error) + Send + 'static,
    {
        let store = self.clone();
        thread::Builder::new()
            .name(format!("kv-applier-{node_id}"))
            .spawn(move || {
                for batch in commits.iter() {
                    if let Err(err) = store.apply(batch) {
                        error!(node = node_id, error = ?err, "applier stopped");
                        on_failure(err.context("state machine failed to apply a commit"));
                        return;
                    }
                }
            })
            .context("failed to spawn applier")
    }
}

impl SnapshotSource for KvStore {
    fn snapshot(&self) -> Result<StateSnapshot> {
        KvStore::snapshot(self)
    }
}
