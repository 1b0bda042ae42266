//! Interactive shell for a replicated key-value cluster.
//!
//! ```bash
//! cargo run --bin kvctl -- --server 127.0.0.1:9001
//! kv> put greeting hello
//! kv> get greeting
//! ```

use std::net::SocketAddr;

use anyhow::Result;
use clap::{Parser, ValueHint};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tracing::warn;

use replicated_kv::error::OK;
use replicated_kv::protocol::{ConsoleCommand, HELP};
use replicated_kv::rpc::RpcClient;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replicated key-value shell", long_about = None)]
struct Args {
    /// Client address of any node
    #[arg(long, default_value = "127.0.0.1:9001", value_hint = ValueHint::Hostname)]
    server: SocketAddr,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

struct Session {
    server: String,
    client: Option<RpcClient>,
}

impl Session {
    async fn connect(&mut self, server: String) {
        match RpcClient::connect(server.as_str()).await {
            Ok(client) => self.client = Some(client),
            Err(err) => {
                warn!(server = %server, error = %err, "not connected");
                self.client = None;
            }
        }
        self.server = server;
    }

    async fn client(&mut self) -> Result<&mut RpcClient> {
        if self.client.is_none() {
            self.client = Some(RpcClient::connect(self.server.as_str()).await?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("not connected to {}", self.server))
    }

    /// Runs one command; returns `false` when the shell should exit.
    async fn execute(&mut self, command: ConsoleCommand) -> Result<bool> {
        let line = match command {
            ConsoleCommand::Exit => return Ok(false),
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Connect { address } => {
                self.connect(address).await;
                match self.client {
                    Some(_) => format!("connected to {}", self.server),
                    None => format!("could not reach {}", self.server),
                }
            }
            ConsoleCommand::Put { key, value } => {
                let reply = self.client().await?.put(&key, &value).await?;
                describe(&reply.err, reply.leader, || {
                    if reply.previous_value.is_empty() {
                        "OK".to_string()
                    } else {
                        format!("OK (was {})", reply.previous_value)
                    }
                })
            }
            ConsoleCommand::Get { key } => {
                let reply = self.client().await?.get(&key).await?;
                describe(&reply.err, reply.leader, || reply.value.clone())
            }
            ConsoleCommand::Add { id, address } => {
                let reply = self.client().await?.add_member(id, &address).await?;
                describe(&reply.err, reply.leader, || format!("adding node {id}"))
                    + &detail(&reply.message)
            }
            ConsoleCommand::Remove { id } => {
                let reply = self.client().await?.remove_member(id).await?;
                describe(&reply.err, reply.leader, || format!("removing node {id}"))
                    + &detail(&reply.message)
            }
            ConsoleCommand::Status => {
                let s = self.client().await?.status().await?;
                format!(
                    "node {} {} term={} leader={} available={}",
                    s.id,
                    s.role,
                    s.term,
                    s.leader_id.map_or("-".to_string(), |id| id.to_string()),
                    s.available
                )
            }
        };
        write_stdout(&line).await?;
        Ok(true)
    }
}

fn describe(err: &str, leader: Option<u64>, ok: impl FnOnce() -> String) -> String {
    match (err, leader) {
        (OK, _) => ok(),
        ("NotLeader", Some(leader)) => format!("NotLeader (try node {leader})"),
        (err, _) => err.to_string(),
    }
}

fn detail(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(": {message}")
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn prompt() -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(b"kv> ").await?;
    stdout.flush().await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut session = Session {
        server: String::new(),
        client: None,
    };
    session.connect(args.server.to_string()).await;

    let mut stdin = BufReader::new(io::stdin());
    let mut input = String::new();
    loop {
        prompt().await?;
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                let text = input.trim();
                if text.is_empty() {
                    continue;
                }
                let command = match ConsoleCommand::parse(text) {
                    Ok(command) => command,
                    Err(err) => {
                        write_stdout(&format!("error: {err}")).await?;
                        continue;
                    }
                };
                match session.execute(command).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        // Drop the connection so the next command reconnects.
                        session.client = None;
                        write_stdout(&format!("error: {err:#}")).await?;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
