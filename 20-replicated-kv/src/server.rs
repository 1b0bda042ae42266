//! A whole replicated key-value node, assembled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::{NodeConfig, WorkDir};
use crate::network::{PeerListener, TcpTransport};
use crate::runtime::{DriverIo, NodeHandle, ProposalQueue, spawn_driver};
use crate::service::KvService;
use crate::storage::LogStore;
use crate::store::KvStore;

/// Log store, driver, state machine, peer listener and front-end of one node.
///
/// Dropping the server stops it the same way [`KvServer::kill`] does.
pub struct KvServer {
    id: u64,
    handle: NodeHandle,
    store: KvStore,
    service: KvService,
    listener: Option<PeerListener>,
    applier: Option<JoinHandle<()>>,
    work_dir: Option<WorkDir>,
}

impl KvServer {
    pub fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let id = config.id;

        let (work_dir, data_dir) = match &config.data_dir {
            Some(dir) => (None, dir.clone()),
            None => {
                let work_dir = WorkDir::for_node(id)?;
                let path = work_dir.path().to_path_buf();
                (Some(work_dir), path)
            }
        };
        let storage = LogStore::open(&data_dir)
            .with_context(|| format!("failed to open log store in {}", data_dir.display()))?;

        let proposals = ProposalQueue::new(config.proposal_capacity);
        let store = KvStore::new(proposals.proposer());
        let io = DriverIo {
            proposals,
            transport: Box::new(TcpTransport::new(id, &config.peers)),
            snapshots: Arc::new(store.clone()),
        };

        let raft_addr = config.raft_addr.clone();
        let (handle, commits) = spawn_driver(config, storage, io)?;
        let applier = {
            let handle = handle.clone();
            store.spawn_applier(id, commits, move |err| handle.abort(err))?
        };

        let listener = match PeerListener::bind(id, &raft_addr, handle.peer_sender()) {
            Ok(listener) => listener,
            Err(err) => {
                handle.shutdown();
                handle.join();
                return Err(err);
            }
        };

        let service = KvService::new(store.clone(), handle.subscribe());
        info!(node = id, raft_addr = %listener.local_addr(), data_dir = %data_dir.display(), "node started");

        Ok(Self {
            id,
            handle,
            store,
            service,
            listener: Some(listener),
            applier: Some(applier),
            work_dir,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> &KvService {
        &self.service
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn raft_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(PeerListener::local_addr)
    }

    pub fn add_member(&self, id: u64, address: &str) -> Result<()> {
        self.handle.add_member(id, address)
    }

    pub fn remove_member(&self, id: u64) -> Result<()> {
        self.handle.remove_member(id)
    }

    /// Stops the node: driver first, then the peer listener and the applier.
    /// A per-process work dir is removed; a configured data dir is kept.
    pub fn kill(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.shutdown();
        self.handle.join();
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        if let Some(applier) = self.applier.take() {
            if applier.join().is_err() {
                error!(node = self.id, "applier panicked");
            }
        }
        if let Some(work_dir) = self.work_dir.take() {
            work_dir.remove();
        }
        info!(node = self.id, "node stopped");
    }
}

impl Drop for KvServer {
    fn drop(&mut self) {
        if self.listener.is_some() || self.applier.is_some() {
            self.stop();
        }
    }
}
