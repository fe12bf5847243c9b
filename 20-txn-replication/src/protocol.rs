//! REPL command parsing for the interactive shell.
//!
//! `ConsoleCommand` is what a user types; [`crate::command::Request`] is what
//! goes through the log. Several console commands (GET, STATUS, SNAPSHOT)
//! never touch Raft at all.

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::command::Mutation;

pub const HELP_TEXT: &str = "\
commands (case-insensitive, alias in parentheses):
  PUT (p) <key> <value>                    replicate a raw put
  GET (g) <key>                            read the local store
  DEL (d) <key>                            replicate a raw delete
  TXN (t) [ttl] PUT <k> <v> | DEL <k> ...  two-phase commit of the listed mutations
  ABORT (a) <key>...                       release locks on keys
  SNAPSHOT <path>                          write the local store to a file
  STATUS (s)                               role, leader, store and locks
  CAMPAIGN (c)                             start an election on this node
  HELP (h)                                 this text
  EXIT (e)                                 shut down this node";

/// Commands that can be entered at the REPL prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put { key: String, value: String },
    Get { key: String },
    Del { key: String },
    /// `ttl` is `None` when the user left it to the node default.
    Txn { ttl: Option<u64>, mutations: Vec<Mutation> },
    Abort { keys: Vec<String> },
    Snapshot { path: PathBuf },
    Status,
    Campaign,
    Exit,
    Help,
}

impl ConsoleCommand {
    /// Parses a line of user input into a command.
    ///
    /// Commands are case-insensitive; single-letter aliases expand first.
    /// Keys and values are single whitespace-free words.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "D" => "DEL",
            "T" => "TXN",
            "A" => "ABORT",
            "S" => "STATUS",
            "C" => "CAMPAIGN",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };
        let args = &parts[1..];

        match (normalized_cmd, args) {
            ("EXIT", []) => Ok(ConsoleCommand::Exit),
            ("HELP", []) => Ok(ConsoleCommand::Help),
            ("STATUS", []) => Ok(ConsoleCommand::Status),
            ("CAMPAIGN", []) => Ok(ConsoleCommand::Campaign),
            ("GET", [key]) => Ok(ConsoleCommand::Get {
                key: key.to_string(),
            }),
            ("DEL", [key]) => Ok(ConsoleCommand::Del {
                key: key.to_string(),
            }),
            ("PUT", [key, value]) => Ok(ConsoleCommand::Put {
                key: key.to_string(),
                value: value.to_string(),
            }),
            ("SNAPSHOT", [path]) => Ok(ConsoleCommand::Snapshot {
                path: PathBuf::from(path),
            }),
            ("ABORT", keys) if !keys.is_empty() => Ok(ConsoleCommand::Abort {
                keys: keys.iter().map(|k| k.to_string()).collect(),
            }),
            ("TXN", args) => parse_txn(args),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("DEL", _) => Err(anyhow!("DEL requires exactly one argument: DEL <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            ("SNAPSHOT", _) => Err(anyhow!("SNAPSHOT requires a path: SNAPSHOT <path>")),
            ("ABORT", _) => Err(anyhow!("ABORT requires at least one key")),
            ("EXIT" | "HELP" | "STATUS" | "CAMPAIGN", _) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            _ => Err(anyhow!("invalid command. Type HELP for the command list")),
        }
    }
}

/// Parses `[ttl] (PUT k v | DEL k)...`.
fn parse_txn(args: &[&str]) -> Result<ConsoleCommand> {
    let (ttl, mut rest) = match args.first().map(|a| a.parse::<u64>()) {
        Some(Ok(ttl)) => (Some(ttl), &args[1..]),
        _ => (None, args),
    };

    let mut mutations = Vec::new();
    while let Some(op) = rest.first() {
        match (op.to_uppercase().as_str(), rest) {
            ("PUT", [_, key, value, ..]) => {
                mutations.push(Mutation::put(key.as_bytes(), value.as_bytes()));
                rest = &rest[3..];
            }
            ("DEL", [_, key, ..]) => {
                mutations.push(Mutation::delete(key.as_bytes()));
                rest = &rest[2..];
            }
            ("PUT", _) => return Err(anyhow!("TXN: PUT needs a key and a value")),
            ("DEL", _) => return Err(anyhow!("TXN: DEL needs a key")),
            (other, _) => return Err(anyhow!("TXN: expected PUT or DEL, got '{other}'")),
        }
    }

    if mutations.is_empty() {
        return Err(anyhow!("TXN requires at least one PUT or DEL"));
    }
    Ok(ConsoleCommand::Txn { ttl, mutations })
}
