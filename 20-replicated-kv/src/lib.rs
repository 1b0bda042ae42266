//! Raft-based replicated key-value store.
//!
//! A cluster of nodes keeps a string-to-string map consistent by replicating
//! every write through a Raft log. Clients talk to any node over a JSON-lines
//! RPC; only the current leader serves `Get` and `Put`, everyone else answers
//! `NotLeader` with a hint.
//!
//! # Architecture
//!
//! Each node runs several threads connected by crossbeam channels:
//!
//! - **Driver thread**: owns the consensus engine and its log store, ticks
//!   the clock, persists ready batches and publishes commits
//! - **Applier thread**: applies committed entries to the map in log order
//! - **Peer threads**: one listener plus one reader per inbound connection,
//!   and one sender per outbound peer
//! - **Tokio runtime**: serves clients; handlers hop onto the blocking pool
//!
//! The engine is only ever touched by the driver, so it needs no lock. The
//! map sits behind a `parking_lot::RwLock` written by the applier alone.
//!
//! # Modules
//!
//! - [`storage`]: durable log store (`raft::Storage`) with snapshots
//! - [`node`]: the tikv/raft `RawNode` and its ready loop
//! - [`runtime`]: driver thread, proposal queue and node status
//! - [`network`]: TCP peer transport for Raft messages
//! - [`topology`]: membership changes and the peer address book
//! - [`command`]: payloads carried through the log
//! - [`store`]: the replicated map and its applier
//! - [`service`]: `Get`/`Put` front-end with leader checks
//! - [`rpc`]: JSON-lines client protocol, server and client
//! - [`server`]: one node, assembled
//! - [`config`]: node configuration and working directory
//! - [`error`]: client-visible error codes
//! - [`protocol`]: `kvctl` shell parsing

pub mod command;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod rpc;
pub mod runtime;
pub mod server;
pub mod service;
pub mod storage;
pub mod store;
pub mod topology;

pub use config::NodeConfig;
pub use error::KvError;
pub use server::KvServer;
