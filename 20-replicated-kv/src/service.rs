//! Client-facing `Get`/`Put` front-end.
//!
//! Validation and leadership checks happen here and never reach the driver.
//! Only a node whose last published status says `Leader` serves; reads also
//! wait until the state machine has applied through the leader's read index.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{KvError, OK};
use crate::runtime::{NodeRole, NodeStatus};
use crate::store::KvStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReply {
    /// Value the key held when the write was accepted; empty if none.
    pub previous_value: String,
    pub err: String,
    /// Known leader when `err` is `NotLeader`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub value: String,
    pub err: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<u64>,
}

#[derive(Clone)]
pub struct KvService {
    store: KvStore,
    status: watch::Receiver<NodeStatus>,
}

impl KvService {
    pub fn new(store: KvStore, status: watch::Receiver<NodeStatus>) -> Self {
        Self { store, status }
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Accepts a write on the leader and returns the value it replaces.
    ///
    /// The write is only queued; it becomes visible once it commits. The
    /// previous value is read before queueing and is not linearizable.
    pub fn put(&self, key: &str, value: &str) -> Result<Option<String>, KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidArgument("key must not be empty"));
        }
        if value.is_empty() {
            return Err(KvError::InvalidArgument("value must not be empty"));
        }
        let status = self.check_leader()?;

        let previous = self.store.lookup(key);
        self.store.propose(key, value).map_err(|err| {
            debug!(node = status.id, error = %err, "failed to queue write");
            KvError::Unavailable
        })?;
        Ok(previous)
    }

    pub fn get(&self, key: &str) -> Result<String, KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidArgument("key must not be empty"));
        }
        let status = self.check_leader()?;

        let ready = status
            .read_index
            .is_some_and(|read_index| self.store.last_applied() >= read_index);
        if !ready {
            debug!(node = status.id, read_index = ?status.read_index, "leader not caught up, refusing read");
            return Err(KvError::NotLeader {
                leader: status.leader_id,
            });
        }

        self.store.lookup(key).ok_or(KvError::NoSuchKey)
    }

    pub fn handle_put(&self, args: PutArgs) -> PutReply {
        match self.put(&args.key, &args.value) {
            Ok(previous) => PutReply {
                previous_value: previous.unwrap_or_default(),
                err: OK.to_string(),
                leader: None,
            },
            Err(err) => PutReply {
                previous_value: String::new(),
                err: err.code().to_string(),
                leader: leader_hint(&err),
            },
        }
    }

    pub fn handle_get(&self, args: GetArgs) -> GetReply {
        match self.get(&args.key) {
            Ok(value) => GetReply {
                value,
                err: OK.to_string(),
                leader: None,
            },
            Err(err) => GetReply {
                value: String::new(),
                err: err.code().to_string(),
                leader: leader_hint(&err),
            },
        }
    }

    fn check_leader(&self) -> Result<NodeStatus, KvError> {
        let status = self.status();
        if !status.available {
            return Err(KvError::Unavailable);
        }
        if status.role != NodeRole::Leader {
            return Err(KvError::NotLeader {
                leader: status.leader_id,
            });
        }
        Ok(status)
    }
}

fn leader_hint(err: &KvError) -> Option<u64> {
    match err {
        KvError::NotLeader { leader } => *leader,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandPayload, CommitBatch, EntryPayload, LogEntry};
    use crate::runtime::ProposalQueue;

    struct Fixture {
        service: KvService,
        store: KvStore,
        status: watch::Sender<NodeStatus>,
        queue: ProposalQueue,
    }

    fn status(role: NodeRole, read_index: Option<u64>) -> NodeStatus {
        NodeStatus {
            id: 1,
            role,
            leader_id: (role == NodeRole::Leader).then_some(1).or(Some(2)),
            term: 1,
            read_index,
            available: true,
        }
    }

    fn fixture(initial: NodeStatus) -> Fixture {
        let queue = ProposalQueue::new(8);
        let store = KvStore::new(queue.proposer());
        let (status, rx) = watch::channel(initial);
        Fixture {
            service: KvService::new(store.clone(), rx),
            store,
            status,
            queue,
        }
    }

    fn commit(store: &KvStore, index: u64, key: &str, value: &str) {
        let data = CommandPayload::put(key, value).encode().expect("encode");
        store
            .apply(CommitBatch::Entries(vec![LogEntry {
                index,
                term: 1,
                payload: EntryPayload::Command(data),
            }]))
            .expect("apply");
    }

    #[test]
    fn test_empty_arguments_rejected_regardless_of_role() {
        for role in [NodeRole::Leader, NodeRole::Follower, NodeRole::Candidate] {
            let f = fixture(status(role, Some(0)));
            assert!(matches!(f.service.get(""), Err(KvError::InvalidArgument(_))));
            assert!(matches!(f.service.put("", "v"), Err(KvError::InvalidArgument(_))));
            assert!(matches!(f.service.put("k", ""), Err(KvError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_follower_answers_not_leader_without_proposing() {
        let f = fixture(status(NodeRole::Follower, None));
        commit(&f.store, 1, "k", "v");

        assert_eq!(f.service.get("k"), Err(KvError::NotLeader { leader: Some(2) }));
        assert_eq!(f.service.put("k", "v2"), Err(KvError::NotLeader { leader: Some(2) }));
        assert!(f.queue.try_take().is_none());
    }

    #[test]
    fn test_put_returns_previous_and_queues() {
        let f = fixture(status(NodeRole::Leader, Some(0)));
        assert_eq!(f.service.put("test1", "v1"), Ok(None));
        assert!(f.queue.try_take().is_some());

        commit(&f.store, 1, "test1", "v1");
        assert_eq!(f.service.put("test1", "v2"), Ok(Some("v1".to_string())));
        // Not applied yet: the map still holds v1.
        assert_eq!(f.store.lookup("test1"), Some("v1".to_string()));
    }

    #[test]
    fn test_get_waits_for_read_index() {
        let f = fixture(status(NodeRole::Leader, Some(2)));
        commit(&f.store, 1, "k", "v");
        assert!(matches!(f.service.get("k"), Err(KvError::NotLeader { .. })));

        commit(&f.store, 2, "k", "v2");
        assert_eq!(f.service.get("k"), Ok("v2".to_string()));
        assert_eq!(f.service.get("missing"), Err(KvError::NoSuchKey));
    }

    #[test]
    fn test_new_leader_without_read_index_refuses_reads() {
        let f = fixture(status(NodeRole::Leader, None));
        assert!(matches!(f.service.get("k"), Err(KvError::NotLeader { .. })));
    }

    #[test]
    fn test_not_leader_reply_names_the_leader() {
        let f = fixture(status(NodeRole::Follower, None));
        let reply = f.service.handle_get(GetArgs { key: "k".into() });
        assert_eq!(reply.err, "NotLeader");
        assert_eq!(reply.leader, Some(2));
    }

    #[test]
    fn test_unavailable_after_driver_stops() {
        let f = fixture(status(NodeRole::Leader, Some(0)));
        f.status.send_modify(|s| {
            s.available = false;
            s.role = NodeRole::Follower;
        });
        assert_eq!(f.service.get("k"), Err(KvError::Unavailable));
        assert_eq!(f.service.put("k", "v"), Err(KvError::Unavailable));
    }

    #[test]
    fn test_replies_carry_wire_codes() {
        let f = fixture(status(NodeRole::Leader, Some(0)));
        let reply = f.service.handle_put(PutArgs {
            key: "k".into(),
            value: "v".into(),
        });
        assert_eq!(reply.err, OK);
        assert_eq!(reply.previous_value, "");

        let reply = f.service.handle_get(GetArgs { key: "k".into() });
        assert_eq!(reply.err, "NoSuchKey");
        assert_eq!(reply.leader, None);
        let reply = f.service.handle_get(GetArgs { key: String::new() });
        assert_eq!(reply.err, "InvalidArgument");
    }
}
