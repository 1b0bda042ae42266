//! Cluster membership: who is in the cluster and where to reach them.
//!
//! Membership only changes through committed configuration-change entries.
//! The engine carries those as `ConfChange` records whose `context` holds the
//! member's peer address.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow, ensure};
use raft::prelude::{ConfChange, ConfChangeType};
use serde::{Deserialize, Serialize};

/// One member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: u64,
    pub address: String,
}

/// An administrative change to the voter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(ClusterMember),
    Remove(u64),
}

impl MembershipChange {
    /// Builds the engine record that carries this change through the log.
    pub fn to_conf_change(&self) -> ConfChange {
        let mut cc = ConfChange::default();
        match self {
            MembershipChange::Add(member) => {
                cc.set_change_type(ConfChangeType::AddNode);
                cc.node_id = member.id;
                cc.context = member.address.clone().into_bytes().into();
            }
            MembershipChange::Remove(id) => {
                cc.set_change_type(ConfChangeType::RemoveNode);
                cc.node_id = *id;
            }
        }
        cc
    }

    /// Reads a committed engine record back into a membership change.
    pub fn from_conf_change(cc: &ConfChange) -> Result<Self> {
        match cc.change_type() {
            ConfChangeType::AddNode => {
                let address = String::from_utf8(cc.context.to_vec())
                    .map_err(|_| anyhow!("member {} has a non-utf8 address", cc.node_id))?;
                ensure!(!address.is_empty(), "member {} has no address", cc.node_id);
                Ok(MembershipChange::Add(ClusterMember {
                    id: cc.node_id,
                    address,
                }))
            }
            ConfChangeType::RemoveNode => Ok(MembershipChange::Remove(cc.node_id)),
            other => Err(anyhow!("unsupported membership change {other:?}")),
        }
    }
}

/// The driver's local view of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    members: BTreeMap<u64, String>,
}

impl Membership {
    pub fn new(members: BTreeMap<u64, String>) -> Self {
        Self { members }
    }

    /// Applies a committed change. Returns `false` if it was already in effect.
    pub fn apply(&mut self, change: &MembershipChange) -> bool {
        match change {
            MembershipChange::Add(member) => {
                self.members.insert(member.id, member.address.clone()).as_ref()
                    != Some(&member.address)
            }
            MembershipChange::Remove(id) => self.members.remove(id).is_some(),
        }
    }

    pub fn address(&self, id: u64) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.members.keys().copied().collect()
    }

    pub fn as_map(&self) -> &BTreeMap<u64, String> {
        &self.members
    }
}
