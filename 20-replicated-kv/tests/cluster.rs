//! Integration tests for whole nodes talking over real TCP sockets.
//!
//! Every test uses its own port range and its own temp directories so the
//! tests can run in parallel inside one process.

use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tempfile::TempDir;
use tokio::net::TcpListener;

use replicated_kv::KvError;
use replicated_kv::config::NodeConfig;
use replicated_kv::error::OK;
use replicated_kv::rpc::{RpcClient, RpcServer};
use replicated_kv::runtime::NodeRole;
use replicated_kv::server::KvServer;

const TIMEOUT: Duration = Duration::from_secs(10);

fn peers(base_port: u16, n: u64) -> BTreeMap<u64, String> {
    (1..=n)
        .map(|id| (id, format!("127.0.0.1:{}", base_port + id as u16)))
        .collect()
}

fn config(id: u64, peers: &BTreeMap<u64, String>, dir: &Path) -> NodeConfig {
    NodeConfig::new(id, peers[&id].clone(), peers.clone())
        .with_tick_interval(Duration::from_millis(20))
        .with_data_dir(dir)
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > TIMEOUT {
            bail!("timeout waiting for {what}");
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

/// Test harness for a cluster of real nodes with TCP networking.
struct TestCluster {
    peers: BTreeMap<u64, String>,
    tweak: fn(NodeConfig) -> NodeConfig,
    servers: BTreeMap<u64, KvServer>,
    dirs: BTreeMap<u64, TempDir>,
}

impl TestCluster {
    fn spawn(n: u64, base_port: u16) -> Result<Self> {
        Self::spawn_with(n, base_port, |config| config)
    }

    fn spawn_with(n: u64, base_port: u16, tweak: fn(NodeConfig) -> NodeConfig) -> Result<Self> {
        let mut cluster = Self {
            peers: peers(base_port, n),
            tweak,
            servers: BTreeMap::new(),
            dirs: BTreeMap::new(),
        };
        for id in 1..=n {
            cluster.dirs.insert(id, tempfile::tempdir()?);
            cluster.start(id)?;
        }
        Ok(cluster)
    }

    /// Starts (or restarts) a node over its existing data dir.
    fn start(&mut self, id: u64) -> Result<()> {
        let config = (self.tweak)(config(id, &self.peers, self.dirs[&id].path()));
        self.servers.insert(id, KvServer::start(config)?);
        Ok(())
    }

    fn node(&self, id: u64) -> &KvServer {
        &self.servers[&id]
    }

    fn kill(&mut self, id: u64) {
        if let Some(server) = self.servers.remove(&id) {
            server.kill();
        }
    }

    /// Waits until exactly one live node says it leads and can serve reads.
    fn wait_for_leader(&self) -> Result<u64> {
        let mut leader = None;
        wait_until("a leader", || {
            let leaders: Vec<u64> = self
                .servers
                .values()
                .filter(|s| s.handle().status().role == NodeRole::Leader)
                .map(KvServer::id)
                .collect();
            leader = match leaders.as_slice() {
                [id] if self.servers[id].service().get("leader-check") == Err(KvError::NoSuchKey) => {
                    Some(*id)
                }
                _ => None,
            };
            leader.is_some()
        })?;
        leader.ok_or_else(|| anyhow::anyhow!("no leader"))
    }

    /// Puts through the leader and waits until every live node applied it.
    fn put_and_wait(&self, leader: u64, key: &str, value: &str) -> Result<Option<String>> {
        let previous = self.node(leader).service().put(key, value)?;
        wait_until(&format!("{key}={value} on all nodes"), || {
            self.servers
                .values()
                .all(|s| s.store().lookup(key).as_deref() == Some(value))
        })?;
        Ok(previous)
    }
}

#[test]
fn test_single_node_sequential_writes() -> Result<()> {
    let cluster = TestCluster::spawn(1, 17100)?;
    let leader = cluster.wait_for_leader()?;
    assert_eq!(leader, 1);

    assert_eq!(cluster.put_and_wait(leader, "test1", "v1")?, None);
    assert_eq!(cluster.put_and_wait(leader, "test1", "v2")?, Some("v1".to_string()));
    assert_eq!(cluster.put_and_wait(leader, "test1", "v3")?, Some("v2".to_string()));
    assert_eq!(cluster.node(leader).service().get("test1"), Ok("v3".to_string()));
    Ok(())
}

#[test]
fn test_invalid_and_missing_keys() -> Result<()> {
    let cluster = TestCluster::spawn(1, 17110)?;
    let leader = cluster.node(cluster.wait_for_leader()?);

    assert!(matches!(leader.service().put("", "v"), Err(KvError::InvalidArgument(_))));
    assert!(matches!(leader.service().get(""), Err(KvError::InvalidArgument(_))));
    assert_eq!(leader.service().get("never-written"), Err(KvError::NoSuchKey));
    Ok(())
}

#[test]
fn test_followers_redirect_to_leader() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17120)?;
    let leader = cluster.wait_for_leader()?;
    cluster.put_and_wait(leader, "k", "v")?;

    for id in (1..=3).filter(|id| *id != leader) {
        let follower = cluster.node(id);
        wait_until("follower to learn the leader", || {
            follower.handle().status().leader_id == Some(leader)
        })?;
        assert_eq!(
            follower.service().get("k"),
            Err(KvError::NotLeader {
                leader: Some(leader)
            })
        );
        assert_eq!(
            follower.service().put("k", "v2"),
            Err(KvError::NotLeader {
                leader: Some(leader)
            })
        );
        // Replicated data is still there, just not served.
        assert_eq!(follower.store().lookup("k"), Some("v".to_string()));
    }
    Ok(())
}

#[test]
fn test_survivors_serve_after_leader_is_killed() -> Result<()> {
    let mut cluster = TestCluster::spawn(3, 17130)?;
    let leader = cluster.wait_for_leader()?;
    cluster.put_and_wait(leader, "test1", "v1")?;
    cluster.put_and_wait(leader, "test1", "v2")?;
    cluster.put_and_wait(leader, "test1", "v3")?;

    cluster.kill(leader);
    let new_leader = cluster.wait_for_leader()?;
    assert_ne!(new_leader, leader);
    assert_eq!(cluster.node(new_leader).service().get("test1"), Ok("v3".to_string()));

    assert_eq!(cluster.put_and_wait(new_leader, "test1", "v4")?, Some("v3".to_string()));
    Ok(())
}

#[test]
fn test_restart_restores_from_snapshot_and_log() -> Result<()> {
    let mut cluster = TestCluster::spawn_with(1, 17140, |config| config.with_snapshot_threshold(5))?;
    let leader = cluster.wait_for_leader()?;
    for i in 0..23 {
        cluster.put_and_wait(leader, &format!("key{}", i % 7), &format!("value{i}"))?;
    }
    let before = cluster.node(leader).store().contents();
    assert_eq!(before.len(), 7);
    assert!(cluster.dirs[&1].path().join("snapshot").exists());

    cluster.kill(1);
    cluster.start(1)?;
    let leader = cluster.wait_for_leader()?;
    wait_until("state to be rebuilt", || {
        cluster.node(leader).store().contents() == before
    })?;
    assert_eq!(cluster.node(leader).service().get("key1"), Ok("value22".to_string()));
    Ok(())
}

#[test]
fn test_new_member_joins_and_catches_up() -> Result<()> {
    let mut cluster = TestCluster::spawn(3, 17150)?;
    let leader = cluster.wait_for_leader()?;
    cluster.put_and_wait(leader, "before", "join")?;

    let addr = "127.0.0.1:17154".to_string();
    let dir = tempfile::tempdir()?;
    let joiner = NodeConfig::new(4, addr.clone(), cluster.peers.clone())
        .with_join(true)
        .with_tick_interval(Duration::from_millis(20))
        .with_data_dir(dir.path());
    cluster.servers.insert(4, KvServer::start(joiner)?);
    cluster.dirs.insert(4, dir);

    cluster.node(leader).add_member(4, &addr)?;
    wait_until("new member to catch up", || {
        cluster.node(4).store().lookup("before").as_deref() == Some("join")
    })?;
    cluster.put_and_wait(leader, "after", "join")?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_against_a_live_node() -> Result<()> {
    let cluster = TestCluster::spawn(1, 17160)?;
    let leader = cluster.wait_for_leader()?;
    let node = cluster.node(leader);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let rpc = RpcServer::new(listener, node.service().clone()).with_admin(node.handle().clone());
    let addr = rpc.local_addr()?;
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(rpc.run_until(async {
        let _ = stopped.await;
    }));

    let mut client = RpcClient::connect(addr).await?;
    let reply = client.put("rpc", "one").await?;
    assert_eq!((reply.err.as_str(), reply.previous_value.as_str()), (OK, ""));

    let start = Instant::now();
    loop {
        let reply = client.get("rpc").await?;
        if reply.err == OK {
            assert_eq!(reply.value, "one");
            break;
        }
        assert!(start.elapsed() < TIMEOUT, "write never became visible: {reply:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let reply = client.get("missing").await?;
    assert_eq!(reply.err, "NoSuchKey");
    let status = client.status().await?;
    assert_eq!((status.id, status.role.as_str()), (1, "Leader"));

    let _ = stop.send(());
    task.await??;
    Ok(())
}
