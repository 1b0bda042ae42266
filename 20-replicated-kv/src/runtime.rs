//! Node driver: the single-threaded control loop around a [`RaftNode`].
//!
//! - **Worker thread**: owns the node and its log store; ticks the engine,
//!   drains proposals and peer messages, persists and publishes ready batches
//! - **Commit channel**: carries [`CommitBatch`]es to the state machine in
//!   log order
//! - **Status channel**: a `tokio::sync::watch` the front-end reads role and
//!   readiness from
//!
//! Everything outside the worker talks to it through channels, so the
//! engine never needs a lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail, ensure};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use raft::StateRole;
use raft::prelude::Message;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::command::{CommitBatch, StateSnapshot};
use crate::config::NodeConfig;
use crate::network::Transport;
use crate::node::{RaftNode, ReadyBundle};
use crate::storage::LogStore;
use crate::topology::{ClusterMember, Membership, MembershipChange};

/// Role as surfaced to the front-end. Pre-candidates count as candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl From<StateRole> for NodeRole {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Leader => NodeRole::Leader,
            StateRole::Candidate | StateRole::PreCandidate => NodeRole::Candidate,
            StateRole::Follower => NodeRole::Follower,
        }
    }
}

/// What the driver publishes about itself after every loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: u64,
    pub role: NodeRole,
    pub leader_id: Option<u64>,
    pub term: u64,
    /// Commit index reads must wait for; `None` unless this node is a leader
    /// with an entry of its own term committed.
    pub read_index: Option<u64>,
    /// False once the driver has stopped, for whatever reason.
    pub available: bool,
}

impl NodeStatus {
    fn starting(id: u64) -> Self {
        Self {
            id,
            role: NodeRole::Follower,
            leader_id: None,
            term: 0,
            read_index: None,
            available: true,
        }
    }

    fn stopped(mut self) -> Self {
        self.role = NodeRole::Follower;
        self.read_index = None;
        self.available = false;
        self
    }
}

/// Source of state machine snapshots for log compaction.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Result<StateSnapshot>;
}

/// Write side of the proposal queue.
///
/// `propose` blocks only while the queue is full and silently drops the
/// payload once the driver has gone away.
#[derive(Clone)]
pub struct Proposer {
    tx: Sender<Vec<u8>>,
}

impl Proposer {
    /// Returns false if the payload was dropped because the driver is gone.
    pub fn propose(&self, data: Vec<u8>) -> bool {
        self.tx.send(data).is_ok()
    }
}

/// Bounded queue between front-end and driver.
///
/// # Why a bounded queue?
///
/// Backpressure. The driver takes proposals only as fast as it can append
/// and fsync them, so when clients outrun the disk the front-end blocks
/// instead of the driver buffering writes in memory without limit.
pub struct ProposalQueue {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl ProposalQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    pub fn proposer(&self) -> Proposer {
        Proposer {
            tx: self.tx.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn try_take(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

/// Collaborators the driver needs besides its configuration and log.
pub struct DriverIo {
    pub proposals: ProposalQueue,
    pub transport: Box<dyn Transport>,
    pub snapshots: Arc<dyn SnapshotSource>,
}

enum Control {
    ConfChange {
        change: MembershipChange,
        respond_to: Option<Sender<Result<()>>>,
    },
    Campaign {
        respond_to: Sender<Result<()>>,
    },
    Abort(anyhow::Error),
    Shutdown,
}

/// Handle for talking to a running driver. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    id: u64,
    proposer: Proposer,
    peer_tx: Sender<Message>,
    control_tx: Sender<Control>,
    status_rx: watch::Receiver<NodeStatus>,
    errors: Receiver<anyhow::Error>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl NodeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues opaque command bytes for the log. Confirmation only ever
    /// arrives as a later [`CommitBatch`].
    pub fn propose(&self, data: Vec<u8>) -> bool {
        self.proposer.propose(data)
    }

    pub fn proposer(&self) -> Proposer {
        self.proposer.clone()
    }

    /// Feeds an inbound peer message to the engine.
    pub fn step(&self, msg: Message) {
        let _ = self.peer_tx.send(msg);
    }

    /// Where the peer listener forwards inbound messages.
    pub fn peer_sender(&self) -> Sender<Message> {
        self.peer_tx.clone()
    }

    /// Queues a membership change without waiting for anything.
    pub fn propose_conf_change(&self, change: MembershipChange) {
        let _ = self.control_tx.send(Control::ConfChange {
            change,
            respond_to: None,
        });
    }

    /// Proposes adding a voter. Returns once the engine has accepted the
    /// proposal; the change takes effect when it commits.
    pub fn add_member(&self, id: u64, address: impl Into<String>) -> Result<()> {
        let address = address.into();
        ensure!(id != 0, "node id 0 is reserved");
        ensure!(!address.is_empty(), "member {id} needs an address");
        self.conf_change(MembershipChange::Add(ClusterMember { id, address }))
    }

    /// Proposes removing a voter.
    pub fn remove_member(&self, id: u64) -> Result<()> {
        self.conf_change(MembershipChange::Remove(id))
    }

    fn conf_change(&self, change: MembershipChange) -> Result<()> {
        let (resp_tx, resp_rx) = bounded(1);
        self.control_tx
            .send(Control::ConfChange {
                change,
                respond_to: Some(resp_tx),
            })
            .map_err(|_| anyhow!("node {} has stopped", self.id))?;
        resp_rx.recv().context("conf change response channel closed")?
    }

    /// Forces this node to start an election.
    pub fn campaign(&self) -> Result<()> {
        let (resp_tx, resp_rx) = bounded(1);
        self.control_tx
            .send(Control::Campaign {
                respond_to: resp_tx,
            })
            .map_err(|_| anyhow!("node {} has stopped", self.id))?;
        resp_rx.recv().context("campaign response channel closed")?
    }

    pub fn status(&self) -> NodeStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status_rx.clone()
    }

    /// Receives the error that stopped the driver, if one does.
    pub fn errors(&self) -> Receiver<anyhow::Error> {
        self.errors.clone()
    }

    /// Stops the driver with `err`, the same way a storage or engine failure
    /// does: the error is reported on [`NodeHandle::errors`] and the node
    /// becomes unavailable for good.
    pub fn abort(&self, err: anyhow::Error) {
        let _ = self.control_tx.send(Control::Abort(err));
    }

    /// Asks the driver to stop after the batch it is working on.
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }

    /// Waits for the worker thread to exit.
    pub fn join(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!(node = self.id, "raft worker panicked");
            }
        }
    }
}

/// Opens the node over `storage` and spawns its driver.
///
/// Returns the handle and the commit channel. If the store holds a snapshot,
/// it is the first batch on the commit channel.
pub fn spawn_driver(
    config: NodeConfig,
    storage: LogStore,
    io: DriverIo,
) -> Result<(NodeHandle, Receiver<CommitBatch>)> {
    config.validate()?;

    let (node, restored) = RaftNode::open(&config, storage.clone())?;
    let members = storage.rl().load_members()?.unwrap_or_else(|| {
        let mut members = config.peers.clone();
        members.insert(config.id, config.raft_addr.clone());
        members
    });

    let (commit_tx, commit_rx) = unbounded();
    if let Some(snapshot) = restored {
        info!(node = config.id, index = snapshot.index, "restoring from snapshot");
        let _ = commit_tx.send(CommitBatch::Snapshot(snapshot));
    }

    let (peer_tx, peer_rx) = unbounded();
    let (control_tx, control_rx) = unbounded();
    let (error_tx, error_rx) = bounded(1);
    let (status_tx, status_rx) = watch::channel(NodeStatus::starting(config.id));

    let proposer = io.proposals.proposer();
    let mut worker = Worker {
        id: config.id,
        tick_interval: config.tick_interval,
        snapshot_threshold: config.snapshot_threshold,
        node,
        storage,
        membership: Membership::new(members),
        proposals: io.proposals.rx,
        peer_rx,
        control_rx,
        commit_tx,
        transport: io.transport,
        snapshots: io.snapshots,
        status_tx,
        last_role: NodeRole::Follower,
        removed: false,
    };
    worker.transport.set_peers(worker.membership.as_map());
    worker.storage.rl().save_members(worker.membership.as_map())?;

    let id = config.id;
    let thread = thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            let result = worker.run();
            worker.transport.close();
            if let Err(err) = result {
                error!(node = id, error = ?err, "raft worker stopped");
                let _ = error_tx.try_send(err);
            } else {
                info!(node = id, "raft worker stopped");
            }
            worker
                .status_tx
                .send_modify(|status| *status = status.clone().stopped());
        })
        .context("failed to spawn raft worker")?;

    Ok((
        NodeHandle {
            id,
            proposer,
            peer_tx,
            control_tx,
            status_rx,
            errors: error_rx,
            worker: Arc::new(Mutex::new(Some(thread))),
        },
        commit_rx,
    ))
}

/// The worker that runs the Raft event loop.
struct Worker {
    id: u64,
    tick_interval: Duration,
    snapshot_threshold: u64,
    node: RaftNode,
    storage: LogStore,
    membership: Membership,
    proposals: Receiver<Vec<u8>>,
    peer_rx: Receiver<Message>,
    control_rx: Receiver<Control>,
    commit_tx: Sender<CommitBatch>,
    transport: Box<dyn Transport>,
    snapshots: Arc<dyn SnapshotSource>,
    status_tx: watch::Sender<NodeStatus>,
    last_role: NodeRole,
    removed: bool,
}

impl Worker {
    /// Runs the event loop until shutdown, removal or a fatal error.
    ///
    /// Each iteration:
    /// 1. Wait (until the next tick at most) for a control request,
    ///    proposal or peer message, then drain whatever else is queued
    /// 2. Tick if the interval has elapsed
    /// 3. Persist and publish every pending ready batch
    /// 4. Compact the log if enough has been applied
    /// 5. Publish status
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        self.publish_status();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.control_rx) -> req => match req {
                    Ok(Control::Shutdown) | Err(_) => break,
                    Ok(Control::Abort(err)) => return Err(err),
                    Ok(req) => self.handle_control(req),
                },
                recv(self.proposals) -> data => match data {
                    Ok(data) => self.propose(data),
                    Err(_) => break,
                },
                recv(self.peer_rx) -> msg => {
                    if let Ok(msg) = msg {
                        self.step(msg);
                    }
                },
                default(timeout) => {}
            }
            self.drain_inputs();

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            if self.removed {
                info!(node = self.id, "removed from the cluster, stopping");
                break;
            }
            self.maybe_snapshot()?;
            self.publish_status();
        }
        Ok(())
    }

    fn drain_inputs(&mut self) {
        while let Ok(data) = self.proposals.try_recv() {
            self.propose(data);
        }
        while let Ok(msg) = self.peer_rx.try_recv() {
            self.step(msg);
        }
    }

    fn handle_control(&mut self, req: Control) {
        match req {
            Control::ConfChange { change, respond_to } => {
                let result = self.node.propose_conf_change(&change);
                match &result {
                    Ok(()) => info!(node = self.id, ?change, "proposed membership change"),
                    Err(err) => debug!(node = self.id, ?change, error = %err, "membership change rejected"),
                }
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(result);
                }
            }
            Control::Campaign { respond_to } => {
                let _ = respond_to.send(self.node.campaign());
            }
            Control::Abort(_) | Control::Shutdown => {}
        }
    }

    /// Proposals on a non-leader are dropped; the client only ever learns
    /// about writes through the commit stream.
    fn propose(&mut self, data: Vec<u8>) {
        if let Err(err) = self.node.propose(data) {
            debug!(node = self.id, error = %err, "dropping proposal");
        }
    }

    fn step(&mut self, msg: Message) {
        let from = msg.from;
        if let Err(err) = self.node.step(msg) {
            debug!(node = self.id, peer = from, error = %err, "ignoring peer message");
        }
    }

    /// Drains all ready state from Raft.
    ///
    /// Messages go out only after `poll_ready` has persisted what they
    /// describe; commits go to the state machine in the order produced.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            let ReadyBundle {
                messages,
                commits,
                membership,
                restored_members,
            } = bundle;

            for msg in messages {
                self.dispatch_message(msg);
            }
            if let Some(members) = restored_members {
                self.restore_membership(members)?;
            }
            for change in membership {
                self.apply_membership(change)?;
            }
            for batch in commits {
                if let Some(index) = batch.last_index() {
                    debug!(node = self.id, index, "publishing commit batch");
                }
                if self.commit_tx.send(batch).is_err() {
                    bail!("state machine stopped taking commits");
                }
            }
        }
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) {
        if msg.to == self.id {
            self.step(msg);
        } else {
            self.transport.send(msg);
        }
    }

    fn apply_membership(&mut self, change: MembershipChange) -> Result<()> {
        if let MembershipChange::Remove(id) = &change {
            if *id == self.id {
                self.removed = true;
            }
        }
        if self.membership.apply(&change) {
            info!(node = self.id, ?change, members = ?self.membership.ids(), "membership changed");
            self.transport.set_peers(self.membership.as_map());
            self.storage.rl().save_members(self.membership.as_map())?;
        }
        Ok(())
    }

    fn restore_membership(&mut self, mut members: BTreeMap<u64, String>) -> Result<()> {
        if let Some(own) = self.membership.address(self.id) {
            members.entry(self.id).or_insert_with(|| own.to_string());
        }
        self.membership = Membership::new(members);
        self.transport.set_peers(self.membership.as_map());
        self.storage.rl().save_members(self.membership.as_map())?;
        Ok(())
    }

    /// Compacts the log once `snapshot_threshold` entries have been applied
    /// past the last snapshot.
    fn maybe_snapshot(&mut self) -> Result<()> {
        if self.snapshot_threshold == 0 {
            return Ok(());
        }
        let last_snapshot = self.node.snapshot_index();
        if self.node.applied() < last_snapshot + self.snapshot_threshold {
            return Ok(());
        }

        let snapshot = self.snapshots.snapshot().context("state machine snapshot failed")?;
        if snapshot.index <= last_snapshot {
            // The state machine has not caught up with the commit stream yet.
            return Ok(());
        }
        let index = snapshot.index;
        self.node.compact(snapshot, self.membership.as_map())?;
        info!(node = self.id, index, "took snapshot");
        Ok(())
    }

    fn publish_status(&mut self) {
        let role = NodeRole::from(self.node.role());
        let leader = self.node.leader_id();
        if role != self.last_role {
            info!(
                node = self.id,
                from = ?self.last_role,
                to = ?role,
                term = self.node.term(),
                leader,
                "role changed"
            );
            self.last_role = role;
        }

        let status = NodeStatus {
            id: self.id,
            role,
            leader_id: (leader != 0).then_some(leader),
            term: self.node.term(),
            read_index: self.node.read_index(),
            available: true,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
