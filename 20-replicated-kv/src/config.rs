//! Node configuration and the per-process working directory.
//!
//! Everything a node needs is passed in through [`NodeConfig`] at
//! construction time; nothing is read from process-wide state.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use tracing::{debug, warn};

/// Configuration for spawning a replicated key-value node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique ID
    pub id: u64,
    /// Address to bind for incoming Raft messages (e.g., "127.0.0.1:7101")
    pub raft_addr: String,
    /// Initial members: node ID -> Raft address (including self)
    pub peers: BTreeMap<u64, String>,
    /// Join an existing cluster: `peers` lists its members, self excluded
    pub join: bool,
    /// Where the log store lives. `None` uses a per-process [`WorkDir`]
    /// that is removed on clean shutdown.
    pub data_dir: Option<PathBuf>,
    /// Raft logical clock interval
    pub tick_interval: Duration,
    /// Ticks without a heartbeat before a follower campaigns
    pub election_tick: usize,
    /// Ticks between leader heartbeats
    pub heartbeat_tick: usize,
    /// Applied entries since the last snapshot before a new one is taken.
    /// 0 disables snapshots.
    pub snapshot_threshold: u64,
    /// Capacity of the proposal queue between the front-end and the driver
    pub proposal_capacity: usize,
}

impl NodeConfig {
    pub fn new(id: u64, raft_addr: impl Into<String>, peers: BTreeMap<u64, String>) -> Self {
        Self {
            id,
            raft_addr: raft_addr.into(),
            peers,
            join: false,
            data_dir: None,
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
            snapshot_threshold: 1000,
            proposal_capacity: 256,
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_election_ticks(mut self, election_tick: usize, heartbeat_tick: usize) -> Self {
        self.election_tick = election_tick;
        self.heartbeat_tick = heartbeat_tick;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_proposal_capacity(mut self, capacity: usize) -> Self {
        self.proposal_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.id != 0, "node id 0 is reserved");
        if !self.join {
            ensure!(
                self.peers.contains_key(&self.id),
                "node id {} missing from peers map",
                self.id
            );
        }
        ensure!(!self.tick_interval.is_zero(), "tick interval must be positive");
        ensure!(self.heartbeat_tick > 0, "heartbeat tick must be positive");
        ensure!(
            self.heartbeat_tick < self.election_tick,
            "election tick ({}) must exceed heartbeat tick ({})",
            self.election_tick,
            self.heartbeat_tick
        );
        ensure!(self.proposal_capacity > 0, "proposal queue needs capacity");
        Ok(())
    }

    /// Engine configuration. `applied` is the index already folded into the
    /// state machine (the snapshot index on restart).
    pub fn raft_config(&self, applied: u64) -> raft::Config {
        raft::Config {
            id: self.id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            applied,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        }
    }
}

/// Scratch directory keyed by user id and process id.
///
/// Layout: `$TMPDIR/replicated-kv-<uid>/<pid>-node-<id>`. Removed by
/// [`WorkDir::remove`] on clean shutdown.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn for_node(node_id: u64) -> Result<Self> {
        Self::under(&std::env::temp_dir(), node_id)
    }

    pub fn under(base: &Path, node_id: u64) -> Result<Self> {
        let path = base
            .join(format!("replicated-kv-{}", current_uid()))
            .join(format!("{}-node-{}", std::process::id(), node_id));
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create work dir {}", path.display()))?;
        debug!(path = %path.display(), "created work dir");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove work dir");
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
