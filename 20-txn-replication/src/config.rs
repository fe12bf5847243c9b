//! Node configuration and peer-map parsing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};

/// How long a client waits for its proposal to be applied.
pub const DEFAULT_PROPOSAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for spawning a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique ID (must appear in `peers`)
    pub id: u64,
    /// Address to bind for incoming Raft messages (e.g., "127.0.0.1:7101")
    pub listen_addr: String,
    /// Map of node ID to network address for all cluster members (including self)
    pub peers: HashMap<u64, String>,
    /// Snapshot file loaded into the store before the node starts
    pub restore_from: Option<PathBuf>,
    /// Upper bound on [`crate::runtime::NodeHandle::submit`] waiting for an apply
    pub proposal_timeout: Duration,
}

impl NodeConfig {
    pub fn new(id: u64, listen_addr: impl Into<String>, peers: HashMap<u64, String>) -> Self {
        Self {
            id,
            listen_addr: listen_addr.into(),
            peers,
            restore_from: None,
            proposal_timeout: DEFAULT_PROPOSAL_TIMEOUT,
        }
    }

    /// Checks that the peer map forms a usable voter set containing this node.
    ///
    /// An even voter count buys no extra fault tolerance over the next smaller
    /// odd count, so it is rejected.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.peers.is_empty(), "topology requires at least one node");
        ensure!(
            self.peers.len() % 2 == 1,
            "topology must have an odd number of nodes, got {}",
            self.peers.len()
        );
        ensure!(
            !self.proposal_timeout.is_zero(),
            "proposal timeout must be greater than zero"
        );
        ensure!(
            self.peers.contains_key(&self.id),
            "node id {} missing from peers map",
            self.id
        );
        Ok(())
    }

    /// Voter IDs in ascending order.
    pub fn voters(&self) -> Vec<u64> {
        let mut voters: Vec<u64> = self.peers.keys().copied().collect();
        voters.sort_unstable();
        voters
    }
}

/// Parses `id=addr` entries into a peer map.
pub fn parse_peers<S: AsRef<str>>(entries: &[S]) -> Result<HashMap<u64, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let entry = entry.as_ref();
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: u64 = id_str
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        ensure!(!addr.trim().is_empty(), "empty address in peer entry '{entry}'");
        if peers.insert(id, addr.trim().to_string()).is_some() {
            return Err(anyhow!("peer id {id} listed more than once"));
        }
    }
    ensure!(
        !peers.is_empty(),
        "at least one --peer entry is required (include self)"
    );
    Ok(peers)
}
