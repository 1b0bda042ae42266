//! Runs one replicated key-value node.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin kvnode -- \
//!   --id 1 --listen 127.0.0.1:9001 --raft-addr 127.0.0.1:7101 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminals 2 and 3: same with --id 2/3, --listen 9002/9003, --raft-addr 7102/7103
//! ```
//!
//! A fourth node joins an existing cluster with `--join`, listing the
//! existing members as peers, after `kvctl` has run `ADD 4 127.0.0.1:7104`
//! against the leader.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueHint};
use tokio::net::TcpListener;
use tracing::{info, warn};

use replicated_kv::config::NodeConfig;
use replicated_kv::rpc::RpcServer;
use replicated_kv::server::KvServer;

/// Command-line arguments for a node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Replicated key-value node", long_about = None)]
struct Args {
    /// Numeric node ID
    #[arg(long)]
    id: u64,

    /// Address clients connect to
    #[arg(long, default_value = "127.0.0.1:9001", value_hint = ValueHint::Hostname)]
    listen: SocketAddr,

    /// Address peers send Raft messages to
    #[arg(long, value_hint = ValueHint::Hostname)]
    raft_addr: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self unless --join)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Join an existing cluster instead of bootstrapping one
    #[arg(long)]
    join: bool,

    /// Keep the log here instead of a per-process temp directory
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    /// Raft tick interval in milliseconds
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Applied entries between snapshots (0 disables)
    #[arg(long, default_value_t = 1000)]
    snapshot_threshold: u64,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut peers = parse_peers(&args.peer)?;
    if !args.join {
        peers.entry(args.id).or_insert_with(|| args.raft_addr.clone());
    }

    let mut config = NodeConfig::new(args.id, args.raft_addr.clone(), peers)
        .with_join(args.join)
        .with_tick_interval(Duration::from_millis(args.tick_ms))
        .with_snapshot_threshold(args.snapshot_threshold);
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }

    let server = KvServer::start(config)?;
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let rpc = RpcServer::new(listener, server.service().clone()).with_admin(server.handle().clone());
    info!(node = args.id, addr = %rpc.local_addr()?, "serving clients");

    let errors = server.handle().errors();
    let fatal = tokio::task::spawn_blocking(move || errors.recv().ok());

    let result = tokio::select! {
        result = rpc.run_until_ctrl_c() => result,
        err = fatal => match err {
            Ok(Some(err)) => {
                warn!(node = args.id, error = ?err, "node stopped");
                Err(err)
            }
            _ => Ok(()),
        },
    };

    tokio::task::spawn_blocking(move || server.kill()).await?;
    result
}

fn parse_peers(entries: &[String]) -> Result<BTreeMap<u64, String>> {
    let mut peers = BTreeMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: u64 = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        peers.insert(id, addr.to_string());
    }
    Ok(peers)
}
