//! Payloads that flow through the replicated log.
//!
//! [`CommandPayload`] is what a client write turns into before it is proposed.
//! [`LogEntry`] and [`CommitBatch`] are what the driver hands to the state
//! machine once the consensus engine has committed something.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::topology::MembershipChange;

/// Commands that flow through the Raft replicated log.
///
/// Encoded with bincode, so keys and values may contain any character
/// (including `:`) without ambiguity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    Put { key: String, value: String },
}

impl CommandPayload {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        CommandPayload::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Decoded view of what a committed entry carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPayload {
    /// Empty entry appended by a new leader.
    Noop,
    /// Opaque client command bytes (normally a [`CommandPayload`]).
    Command(Vec<u8>),
    /// A committed membership change, already applied by the driver.
    Membership(MembershipChange),
}

/// A committed log entry as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

/// Point-in-time copy of the state machine.
///
/// `state` is the serialized key-value map; `index` is the last log index
/// folded into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub index: u64,
    pub state: Vec<u8>,
}

/// Unit of delivery from the node driver to the state machine.
///
/// Batches arrive in log order. A `Snapshot` batch tells the state machine to
/// throw its map away and load the snapshot instead; entries resume after
/// the snapshot index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitBatch {
    Entries(Vec<LogEntry>),
    Snapshot(StateSnapshot),
}

impl CommitBatch {
    /// Highest index this batch covers, if any.
    pub fn last_index(&self) -> Option<u64> {
        match self {
            CommitBatch::Entries(entries) => entries.last().map(|entry| entry.index),
            CommitBatch::Snapshot(snapshot) => Some(snapshot.index),
        }
    }
}
