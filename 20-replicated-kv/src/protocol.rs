//! Command parsing for the `kvctl` shell.
//!
//! This is separate from [`crate::rpc::Request`] because the shell has
//! meta-commands (`CONNECT`, `HELP`, `EXIT`) that never reach a server.

use anyhow::{Result, anyhow};

/// Commands that can be entered at the `kvctl` prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Get { key: String },
    Add { id: u64, address: String },
    Remove { id: u64 },
    Connect { address: String },
    Status,
    Help,
    Exit,
}

pub const HELP: &str = "\
PUT/p <key> <value>    store a value (leader only)
GET/g <key>            read a value (leader only)
ADD/a <id> <address>   add a member at the given raft address
REMOVE/r <id>          remove a member
CONNECT/c <address>    switch to another server
STATUS/s               show role, leader and term
HELP/h                 this text
EXIT/e                 quit";

impl ConsoleCommand {
    /// Parses a line of user input into a command.
    ///
    /// Command words are case-insensitive and have one-letter aliases.
    /// Keys and values are taken verbatim and may contain `:`.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "A" => "ADD",
            "R" => "REMOVE",
            "C" => "CONNECT",
            "S" => "STATUS",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized_cmd, parts.len()) {
            ("EXIT", 1) => Ok(ConsoleCommand::Exit),
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("STATUS", 1) => Ok(ConsoleCommand::Status),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("PUT", 3) => Ok(ConsoleCommand::Put {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("ADD", 3) => Ok(ConsoleCommand::Add {
                id: parse_id(parts[1])?,
                address: parts[2].to_string(),
            }),
            ("REMOVE", 2) => Ok(ConsoleCommand::Remove {
                id: parse_id(parts[1])?,
            }),
            ("CONNECT", 2) => Ok(ConsoleCommand::Connect {
                address: parts[1].to_string(),
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            ("ADD", _) => Err(anyhow!("ADD requires exactly two arguments: ADD <id> <address>")),
            ("REMOVE", _) => Err(anyhow!("REMOVE requires exactly one argument: REMOVE <id>")),
            ("CONNECT", _) => Err(anyhow!("CONNECT requires exactly one argument: CONNECT <address>")),
            ("EXIT" | "HELP" | "STATUS", _) => Err(anyhow!("{normalized_cmd} takes no arguments")),
            _ => Err(anyhow!("invalid command. Try HELP")),
        }
    }
}

fn parse_id(raw: &str) -> Result<u64> {
    match raw.parse::<u64>() {
        Ok(0) => Err(anyhow!("node id 0 is reserved")),
        Ok(id) => Ok(id),
        Err(_) => Err(anyhow!("invalid node id: {raw}")),
    }
}
