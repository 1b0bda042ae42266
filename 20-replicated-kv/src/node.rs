//! Core Raft node implementation.
//!
//! This module wraps the tikv/raft library behind [`RaftNode`], which owns the
//! raw consensus state machine and its durable [`LogStore`]. Everything the
//! engine hands back (messages, committed entries, membership changes,
//! received snapshots) comes out of [`RaftNode::poll_ready`] as one
//! [`ReadyBundle`], already persisted.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use prost::Message as ProstMessage;
use raft::StateRole;
use raft::prelude::{
    ConfChange, ConfChangeV2, ConfState, Entry, EntryType, Message, RawNode, Snapshot,
};
use serde::{Deserialize, Serialize};
use slog::{Logger, o};
use tracing::{debug, warn};

use crate::command::{CommitBatch, EntryPayload, LogEntry, StateSnapshot};
use crate::config::NodeConfig;
use crate::storage::LogStore;
use crate::topology::MembershipChange;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a slog logger, but logging happens at the
/// application level through `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// What a snapshot carries on the wire and on disk: the state machine bytes
/// plus the address book, so a node restored from a snapshot can reach
/// members it never saw being added.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    members: BTreeMap<u64, String>,
    state: Vec<u8>,
}

impl SnapshotEnvelope {
    fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).context("invalid snapshot payload")
    }
}

/// Output from processing a Raft ready state.
///
/// Everything in here is already durable:
/// - **messages**: Raft messages to send to peers
/// - **commits**: committed entries or a received snapshot, in log order
/// - **membership**: committed membership changes, already applied to the engine
/// - **restored_members**: address book from a snapshot installed by the leader
#[derive(Debug, Default)]
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub commits: Vec<CommitBatch>,
    pub membership: Vec<MembershipChange>,
    pub restored_members: Option<BTreeMap<u64, String>>,
}

/// A Raft consensus node backed by a durable [`LogStore`].
///
/// The node is single-threaded by construction: the runtime's worker thread
/// is its only owner.
pub struct RaftNode {
    id: u64,
    raw: RawNode<LogStore>,
    storage: LogStore,
}

impl RaftNode {
    /// Opens a node over `storage`.
    ///
    /// A fresh store is bootstrapped with the configured voters. A joining
    /// node bootstraps with the existing members only and learns about itself
    /// when the leader's `AddNode` entry reaches it.
    ///
    /// Returns the snapshot to restore the state machine from, if the store
    /// has one.
    pub fn open(config: &NodeConfig, storage: LogStore) -> Result<(Self, Option<StateSnapshot>)> {
        {
            let mut core = storage.wl();
            if core.is_fresh() {
                let voters: Vec<u64> = config
                    .peers
                    .keys()
                    .copied()
                    .filter(|id| !config.join || *id != config.id)
                    .collect();
                debug!(id = config.id, ?voters, "bootstrapping fresh log");
                core.set_conf_state(ConfState::from((voters, vec![])))?;
            }
        }

        let restored = match storage.rl().load_snapshot() {
            Some(snapshot) => {
                let envelope = SnapshotEnvelope::decode(&snapshot.data)?;
                Some(StateSnapshot {
                    index: snapshot.get_metadata().index,
                    state: envelope.state,
                })
            }
            None => None,
        };
        let applied = restored.as_ref().map_or(0, |snapshot| snapshot.index);

        let cfg = config.raft_config(applied);
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {}", config.id))?;

        Ok((
            Self {
                id: config.id,
                raw,
                storage,
            },
            restored,
        ))
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

    /// Returns this node's current role.
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

    pub fn committed(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    pub fn applied(&self) -> u64 {
        self.raw.raft.raft_log.applied
    }

    /// Index of the newest snapshot in the log store (0 if none).
    pub fn snapshot_index(&self) -> u64 {
        self.storage.rl().snapshot_index()
    }

    /// Commit index a read must wait for, if this node can serve reads.
    ///
    /// A newly elected leader cannot vouch for its commit index until an
    /// entry of its own term has committed, so this is `None` until then.
    pub fn read_index(&self) -> Option<u64> {
        if self.role() != StateRole::Leader {
            return None;
        }
        let committed = self.committed();
        match self.raw.raft.raft_log.term(committed) {
            Ok(term) if term == self.term() => Some(committed),
            _ => None,
        }
    }

    /// Appends opaque command bytes to the log. Fails when this node is not
    /// the leader.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<()> {
        self.raw.propose(vec![], data).context("propose failed")
    }

    /// Proposes a membership change. Fails when this node is not the leader
    /// or another change is still pending.
    pub fn propose_conf_change(&mut self, change: &MembershipChange) -> Result<()> {
        self.raw
            .propose_conf_change(vec![], change.to_conf_change())
            .context("propose conf change failed")
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Checks if Raft has work to do, persists it, and returns the results.
    ///
    /// Order per ready:
    /// 1. Install a received snapshot
    /// 2. Append new entries
    /// 3. Persist the hard state
    /// 4. Collect messages (only now safe to send)
    /// 5. Decode committed entries, applying membership changes to the engine
    ///
    /// then the same for the follow-up `LightReady`.
    ///
    /// # Why persist before sending?
    ///
    /// A vote or an append acknowledgement is a promise about what is on
    /// disk. If it left before the fsync and the node then crashed, it could
    /// vote twice in one term or forget entries the leader already counted.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut bundle = ReadyBundle::default();

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot, &mut bundle)?;
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage
                .wl()
                .set_hard_state(hard_state.clone())
                .context("persist hard state failed")?;
        }

        bundle.messages.extend(ready.take_messages());
        bundle.messages.extend(ready.take_persisted_messages());
        self.collect_committed(ready.take_committed_entries(), &mut bundle)?;

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage
                .wl()
                .set_commit(commit)
                .context("persist commit index failed")?;
        }

        bundle.messages.extend(light_ready.take_messages());
        self.collect_committed(light_ready.take_committed_entries(), &mut bundle)?;

        self.raw.advance_apply();

        Ok(Some(bundle))
    }

    /// Persists a state machine snapshot and drops the log it covers.
    ///
    /// Does nothing if the store already has a snapshot at or past `snapshot.index`.
    pub fn compact(&mut self, snapshot: StateSnapshot, members: &BTreeMap<u64, String>) -> Result<()> {
        let index = snapshot.index;
        if index <= self.storage.rl().snapshot_index() {
            return Ok(());
        }
        if index > self.applied() {
            bail!("cannot snapshot at {index}: only {} applied", self.applied());
        }

        let term = self
            .raw
            .raft
            .raft_log
            .term(index)
            .with_context(|| format!("no term for snapshot index {index}"))?;
        let envelope = SnapshotEnvelope {
            members: members.clone(),
            state: snapshot.state,
        };

        let mut raft_snapshot = Snapshot::default();
        raft_snapshot.data = bincode::serialize(&envelope)?.into();
        let conf_state = self.storage.rl().conf_state().clone();
        let meta = raft_snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(conf_state);

        self.storage.wl().save_snapshot(raft_snapshot)?;
        debug!(id = self.id, index, term, "compacted log");
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot, bundle: &mut ReadyBundle) -> Result<()> {
        let index = snapshot.get_metadata().index;
        let envelope = SnapshotEnvelope::decode(&snapshot.data)?;
        self.storage
            .wl()
            .apply_snapshot(snapshot)
            .context("apply snapshot failed")?;
        debug!(id = self.id, index, "installed snapshot from leader");

        bundle.commits.push(CommitBatch::Snapshot(StateSnapshot {
            index,
            state: envelope.state,
        }));
        bundle.restored_members = Some(envelope.members);
        Ok(())
    }

    fn collect_committed(&mut self, entries: Vec<Entry>, bundle: &mut ReadyBundle) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => EntryPayload::Noop,
                EntryType::EntryNormal => EntryPayload::Command(entry.data.to_vec()),
                EntryType::EntryConfChange => self.apply_conf_change(&entry, bundle)?,
                EntryType::EntryConfChangeV2 => {
                    if !entry.data.is_empty() {
                        let cc = ConfChangeV2::decode(&entry.data[..])
                            .context("decode conf change v2 failed")?;
                        let conf_state = self.raw.apply_conf_change(&cc)?;
                        self.storage.wl().set_conf_state(conf_state)?;
                    }
                    EntryPayload::Noop
                }
            };
            batch.push(LogEntry {
                index: entry.index,
                term: entry.term,
                payload,
            });
        }
        bundle.commits.push(CommitBatch::Entries(batch));
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &Entry, bundle: &mut ReadyBundle) -> Result<EntryPayload> {
        if entry.data.is_empty() {
            return Ok(EntryPayload::Noop);
        }
        let cc = ConfChange::decode(&entry.data[..]).context("decode conf change failed")?;
        let conf_state = self
            .raw
            .apply_conf_change(&cc)
            .context("apply conf change failed")?;
        self.storage.wl().set_conf_state(conf_state)?;

        match MembershipChange::from_conf_change(&cc) {
            Ok(change) => {
                debug!(id = self.id, index = entry.index, ?change, "membership change committed");
                bundle.membership.push(change.clone());
                Ok(EntryPayload::Membership(change))
            }
            Err(err) => {
                warn!(id = self.id, index = entry.index, error = %err, "ignoring membership entry");
                Ok(EntryPayload::Noop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPayload;
    use crate::topology::ClusterMember;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Test harness for simulating a Raft cluster without networking.
    ///
    /// Routes messages between nodes in-memory and records what each node
    /// committed. Nodes in `isolated` neither send nor receive.
    struct TestCluster {
        nodes: HashMap<u64, RaftNode>,
        dirs: HashMap<u64, TempDir>,
        commits: HashMap<u64, Vec<CommitBatch>>,
        isolated: Vec<u64>,
        peers: BTreeMap<u64, String>,
    }

    fn config(id: u64, peers: &BTreeMap<u64, String>) -> NodeConfig {
        NodeConfig::new(id, format!("127.0.0.1:{}", 7100 + id), peers.clone())
    }

    impl TestCluster {
        fn new(n: u64) -> Result<Self> {
            let peers: BTreeMap<u64, String> =
                (1..=n).map(|id| (id, format!("127.0.0.1:{}", 7100 + id))).collect();
            let mut cluster = Self {
                nodes: HashMap::new(),
                dirs: HashMap::new(),
                commits: HashMap::new(),
                isolated: Vec::new(),
                peers: peers.clone(),
            };
            for id in 1..=n {
                let dir = TempDir::new()?;
                let (node, _) = RaftNode::open(&config(id, &peers), LogStore::open(dir.path())?)?;
                cluster.nodes.insert(id, node);
                cluster.dirs.insert(id, dir);
            }
            Ok(cluster)
        }

        fn node_mut(&mut self, id: u64) -> &mut RaftNode {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn node(&self, id: u64) -> &RaftNode {
            self.nodes.get(&id).expect("node not found")
        }

        fn tick_all(&mut self) {
            for node in self.nodes.values_mut() {
                node.tick();
            }
        }

        /// Processes ready states for all nodes and routes messages.
        ///
        /// Returns number of messages delivered.
        fn deliver_messages(&mut self) -> Result<usize> {
            let mut total_delivered = 0;
            loop {
                let mut messages = Vec::new();
                for (&id, node) in self.nodes.iter_mut() {
                    if let Some(bundle) = node.poll_ready()? {
                        self.commits.entry(id).or_default().extend(bundle.commits);
                        if !self.isolated.contains(&id) {
                            messages.extend(bundle.messages);
                        }
                    }
                }

                messages.retain(|msg| !self.isolated.contains(&msg.to));
                if messages.is_empty() {
                    break;
                }

                total_delivered += messages.len();
                for msg in messages {
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        node.step(msg)?;
                    }
                }
            }
            Ok(total_delivered)
        }

        /// Runs a fixed number of tick + delivery rounds.
        fn stabilize(&mut self, rounds: usize) -> Result<()> {
            for _ in 0..rounds {
                self.tick_all();
                self.deliver_messages()?;
            }
            Ok(())
        }

        fn voters(&self, id: u64) -> Vec<u64> {
            let mut voters = self.node(id).storage.rl().conf_state().voters.clone();
            voters.sort_unstable();
            voters
        }

        fn elect(&mut self, id: u64) -> Result<()> {
            self.node_mut(id).campaign()?;
            self.stabilize(10)?;
            assert_eq!(self.assert_single_leader(), id);
            Ok(())
        }

        fn assert_single_leader(&self) -> u64 {
            let leaders: Vec<u64> = self
                .nodes
                .iter()
                .filter(|(_, n)| n.role() == StateRole::Leader)
                .map(|(id, _)| *id)
                .collect();
            assert_eq!(leaders.len(), 1, "expected exactly one leader, found: {:?}", leaders);
            leaders[0]
        }

        /// Commands committed on `id`, decoded, in order.
        fn applied_commands(&self, id: u64) -> Vec<CommandPayload> {
            let mut out = Vec::new();
            for batch in self.commits.get(&id).into_iter().flatten() {
                match batch {
                    CommitBatch::Snapshot(_) => out.clear(),
                    CommitBatch::Entries(entries) => {
                        for entry in entries {
                            if let EntryPayload::Command(data) = &entry.payload {
                                out.push(CommandPayload::decode(data).expect("valid command"));
                            }
                        }
                    }
                }
            }
            out
        }

        fn propose_put(&mut self, id: u64, key: &str, value: &str) -> Result<()> {
            let data = CommandPayload::put(key, value).encode()?;
            self.node_mut(id).propose(data)?;
            self.deliver_messages()?;
            Ok(())
        }
    }

    #[test]
    fn test_basic_three_node_election() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;

        for id in 1..=3 {
            assert_eq!(cluster.node(id).role(), StateRole::Follower);
            assert_eq!(cluster.node(id).leader_id(), 0);
        }

        cluster.elect(1)?;
        for id in 1..=3 {
            assert_eq!(cluster.node(id).leader_id(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_read_index_waits_for_own_term() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        assert_eq!(cluster.node(1).read_index(), None);

        cluster.node_mut(1).campaign()?;
        cluster.stabilize(10)?;
        let read_index = cluster.node(1).read_index().expect("leader is ready");
        assert_eq!(read_index, cluster.node(1).committed());
        assert_eq!(cluster.node(2).read_index(), None);
        Ok(())
    }

    #[test]
    fn test_commands_commit_in_order_everywhere() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        cluster.propose_put(1, "test1", "v1")?;
        cluster.propose_put(1, "test1", "v2")?;
        cluster.propose_put(1, "a:b", "c:d")?;

        let expected = vec![
            CommandPayload::put("test1", "v1"),
            CommandPayload::put("test1", "v2"),
            CommandPayload::put("a:b", "c:d"),
        ];
        for id in 1..=3 {
            assert_eq!(cluster.applied_commands(id), expected, "node {id}");
        }
        Ok(())
    }

    #[test]
    fn test_follower_rejects_proposals() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        let data = CommandPayload::put("k", "v").encode()?;
        assert!(cluster.node_mut(2).propose(data).is_err());
        Ok(())
    }

    #[test]
    fn test_follower_timeout_elects_new_leader() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        cluster.isolated.push(1);
        for _ in 0..40 {
            cluster.tick_all();
            cluster.deliver_messages()?;
        }

        let leaders: Vec<u64> = [2, 3]
            .into_iter()
            .filter(|&id| cluster.node(id).role() == StateRole::Leader)
            .collect();
        assert_eq!(leaders.len(), 1, "exactly one of nodes 2,3 should be leader");
        // check_quorum makes the isolated leader step down
        assert_ne!(cluster.node(1).role(), StateRole::Leader);
        Ok(())
    }

    #[test]
    fn test_membership_changes_commit_on_all_nodes() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        let remove = MembershipChange::Remove(3);
        cluster.node_mut(1).propose_conf_change(&remove)?;
        cluster.deliver_messages()?;

        for id in 1..=2 {
            let found = cluster.commits[&id].iter().any(|batch| match batch {
                CommitBatch::Entries(entries) => entries
                    .iter()
                    .any(|e| e.payload == EntryPayload::Membership(remove.clone())),
                CommitBatch::Snapshot(_) => false,
            });
            assert!(found, "node {id} should see the removal");
        }

        assert_eq!(cluster.voters(1), vec![1, 2]);

        let add = MembershipChange::Add(ClusterMember {
            id: 4,
            address: "127.0.0.1:7104".to_string(),
        });
        cluster.node_mut(1).propose_conf_change(&add)?;
        cluster.deliver_messages()?;
        assert_eq!(cluster.voters(1), vec![1, 2, 4]);
        Ok(())
    }

    #[test]
    fn test_lagging_follower_catches_up_from_snapshot() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        cluster.isolated.push(3);
        for i in 0..10 {
            cluster.propose_put(1, &format!("k{i}"), "v")?;
        }

        let applied = cluster.node(1).applied();
        let members = cluster.peers.clone();
        cluster.node_mut(1).compact(
            StateSnapshot {
                index: applied,
                state: b"leader-state".to_vec(),
            },
            &members,
        )?;
        assert_eq!(cluster.node(1).storage.rl().snapshot_index(), applied);

        cluster.isolated.clear();
        cluster.stabilize(10)?;

        let restored = cluster.commits[&3].iter().find_map(|batch| match batch {
            CommitBatch::Snapshot(snapshot) => Some(snapshot.clone()),
            CommitBatch::Entries(_) => None,
        });
        let restored = restored.expect("node 3 should receive a snapshot");
        assert_eq!(restored.index, applied);
        assert_eq!(restored.state, b"leader-state".to_vec());
        Ok(())
    }

    #[test]
    fn test_restart_redelivers_after_snapshot() -> Result<()> {
        let peers = BTreeMap::from([(1, "127.0.0.1:7101".to_string())]);
        let dir = TempDir::new()?;
        let snapshot_index;
        {
            let (mut node, restored) = RaftNode::open(&config(1, &peers), LogStore::open(dir.path())?)?;
            assert!(restored.is_none());
            node.campaign()?;
            while node.poll_ready()?.is_some() {}

            for value in ["v1", "v2"] {
                node.propose(CommandPayload::put("k", value).encode()?)?;
                while node.poll_ready()?.is_some() {}
            }
            snapshot_index = node.applied() - 1;
            node.compact(
                StateSnapshot {
                    index: snapshot_index,
                    state: b"upto-v1".to_vec(),
                },
                &peers,
            )?;
        }

        let (mut node, restored) = RaftNode::open(&config(1, &peers), LogStore::open(dir.path())?)?;
        let restored = restored.expect("snapshot on disk");
        assert_eq!(restored.index, snapshot_index);
        assert_eq!(restored.state, b"upto-v1".to_vec());

        let mut redelivered = Vec::new();
        while let Some(bundle) = node.poll_ready()? {
            for batch in bundle.commits {
                if let CommitBatch::Entries(entries) = batch {
                    redelivered.extend(entries);
                }
            }
        }
        assert!(redelivered.iter().all(|entry| entry.index > snapshot_index));
        assert!(redelivered.iter().any(|entry| match &entry.payload {
            EntryPayload::Command(data) =>
                CommandPayload::decode(data).ok() == Some(CommandPayload::put("k", "v2")),
            _ => false,
        }));
        Ok(())
    }
}
