//! Raft node that drives the transactional applier.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` and owns an [`Applier`] over this
//! node's stores. Raft decides the order of entries; the applier decides what
//! each entry does to the data.

use std::io::Read;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use raft::prelude::{ConfState, Config, Entry, EntryType, Message, RawNode};
use raft::storage::MemStorage;
use raft::StateRole;
use slog::{o, Logger};
use tracing::{debug, info_span, Span};

use crate::applier::Applier;
use crate::command::Request;
use crate::error::ApplyError;
use crate::lock_store::MemoryLockStore;
use crate::store::{MemoryStore, Snapshot, Store};

/// The applier type every node runs.
pub type NodeApplier = Applier<MemoryStore, MemoryLockStore>;

/// Creates a logger that discards all output.
///
/// tikv/raft insists on an slog logger; our own diagnostics go through tracing.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Outcome of applying one committed entry on this node.
///
/// `proposal_id` comes from the entry context and lets the node that proposed
/// the entry hand the result back to the waiting client. Followers produce
/// the same reports, with identical results, but nobody waits on them.
#[derive(Debug)]
pub struct ApplyReport {
    pub node_id: u64,
    pub index: u64,
    pub term: u64,
    pub proposal_id: Option<u64>,
    pub result: Result<(), ApplyError>,
}

/// Output from processing a Raft ready state.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

/// A Raft consensus node with an integrated transactional key-value store.
///
/// - **storage**: Raft's replicated log (entries, hard state, snapshots)
/// - **applier**: the state machine writing the store and lock store
///
/// `MemStorage` keeps the log in memory; a restart loses it.
pub struct RaftNode {
    id: u64,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
    applier: NodeApplier,
    span: Span,
}

impl RaftNode {
    /// Creates a node with empty stores.
    ///
    /// `voters` must include `id`. Timing assumes one `tick()` every 100ms:
    /// elections after ~1s without heartbeats, heartbeats every ~300ms.
    pub fn new(id: u64, voters: &[u64]) -> Result<Self> {
        let span = info_span!("node", id);
        let store = Arc::new(MemoryStore::new().with_span(span.clone()));
        let locks = Arc::new(MemoryLockStore::new().with_span(span.clone()));
        let applier = Applier::new(store, locks).with_span(span.clone());
        Self::with_applier(id, voters, applier, span)
    }

    /// Creates a node around a caller-built applier, e.g. one with a test clock.
    pub fn with_applier(id: u64, voters: &[u64], applier: NodeApplier, span: Span) -> Result<Self> {
        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        let storage = MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![])));
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            raw,
            storage,
            applier,
            span,
        })
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election to become leader.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns this node's current role (Follower, Candidate, or Leader).
    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    /// Appends an encoded request to the log, tagged with `proposal_id`.
    ///
    /// Success only means "appended"; the apply result arrives later in an
    /// [`ApplyReport`] carrying the same proposal id. Fails on followers.
    pub fn propose(&mut self, proposal_id: u64, request: &Request) -> Result<()> {
        ensure!(
            self.role() == StateRole::Leader,
            "node {} is not the leader (leader: {})",
            self.id,
            self.leader_id()
        );
        self.raw
            .propose(proposal_id.to_be_bytes().to_vec(), request.encode())
            .context("propose failed")
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// Runs both halves of the ready protocol: persist hard state, any
    /// snapshot, then entries, apply committed entries, then advance and
    /// apply whatever the light ready adds.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        // The log is never compacted, so a raft snapshot carries only
        // metadata; store snapshots travel out of band.
        if !ready.snapshot().is_empty() {
            self.storage
                .wl()
                .apply_snapshot(ready.snapshot().clone())
                .context("apply snapshot failed")?;
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries()));
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }

        applied.extend(self.apply_entries(light_ready.take_committed_entries()));
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    /// Feeds committed normal entries to the applier.
    ///
    /// An entry that fails to apply is reported, not fatal: every replica
    /// fails it the same way and the log keeps moving.
    fn apply_entries(&mut self, entries: Vec<Entry>) -> Vec<ApplyReport> {
        let mut applied = Vec::new();
        for entry in entries {
            if entry.data.is_empty() || entry.entry_type() != EntryType::EntryNormal {
                continue;
            }
            let result = self.applier.apply(&entry.data);
            debug!(parent: &self.span, index = entry.index, term = entry.term, ok = result.is_ok(), "entry applied");
            applied.push(ApplyReport {
                node_id: self.id,
                index: entry.index,
                term: entry.term,
                proposal_id: proposal_id(&entry.context),
                result,
            });
        }
        applied
    }

    /// Local read of the store; reflects whatever this node has applied.
    pub fn value_for(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.applier.store().get(key)?)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        self.applier.store()
    }

    pub fn locks(&self) -> &Arc<MemoryLockStore> {
        self.applier.locks()
    }

    /// Captures the store for shipping or backup.
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.applier.snapshot()?)
    }

    /// Replaces the store from a snapshot stream. Only safe before the node joins the cluster.
    pub fn restore<R: Read>(&mut self, reader: R) -> Result<()> {
        Ok(self.applier.restore(reader)?)
    }
}

fn proposal_id(context: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(context).ok().map(u64::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Mutation;
    use crate::error::ErrorKind;
    use std::collections::{HashMap, HashSet};

    /// Routes messages between nodes in memory for deterministic tests.
    struct TestCluster {
        nodes: HashMap<u64, RaftNode>,
        reports: Vec<ApplyReport>,
        next_proposal: u64,
        /// Nodes whose traffic is dropped in both directions.
        isolated: HashSet<u64>,
    }

    impl TestCluster {
        fn new(n: usize) -> Result<Self> {
            let ids: Vec<u64> = (1..=n as u64).collect();
            let mut nodes = HashMap::new();
            for &id in &ids {
                nodes.insert(id, RaftNode::new(id, &ids)?);
            }
            Ok(Self {
                nodes,
                reports: Vec::new(),
                next_proposal: 1,
                isolated: HashSet::new(),
            })
        }

        fn node_mut(&mut self, id: u64) -> &mut RaftNode {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn node(&self, id: u64) -> &RaftNode {
            self.nodes.get(&id).expect("node not found")
        }

        fn tick_all(&mut self) {
            for node in self.nodes.values_mut() {
                node.tick();
            }
        }

        /// Processes ready states for all nodes and routes messages until quiet.
        fn deliver_messages(&mut self) -> Result<usize> {
            let mut total_delivered = 0;
            loop {
                let mut messages = Vec::new();
                for node in self.nodes.values_mut() {
                    if let Some(bundle) = node.poll_ready()? {
                        messages.extend(bundle.messages);
                        self.reports.extend(bundle.applied);
                    }
                }

                if messages.is_empty() {
                    break;
                }
                total_delivered += messages.len();

                for msg in messages {
                    if self.isolated.contains(&msg.from) || self.isolated.contains(&msg.to) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        node.step(msg)?;
                    }
                }
            }
            Ok(total_delivered)
        }

        fn stabilize(&mut self, max_iters: usize) -> Result<()> {
            for _ in 0..max_iters {
                self.tick_all();
                if self.deliver_messages()? == 0 {
                    break;
                }
            }
            Ok(())
        }

        /// Ticks and delivers `n` times, even when a round is quiet.
        fn run_ticks(&mut self, n: usize) -> Result<()> {
            for _ in 0..n {
                self.tick_all();
                self.deliver_messages()?;
            }
            Ok(())
        }

        fn isolate(&mut self, id: u64) {
            self.isolated.insert(id);
        }

        fn reconnect(&mut self, id: u64) {
            self.isolated.remove(&id);
        }

        fn elect(&mut self, id: u64) -> Result<()> {
            self.node_mut(id).campaign()?;
            self.stabilize(10)?;
            assert_eq!(self.node(id).role(), StateRole::Leader);
            Ok(())
        }

        /// Proposes on `leader`, replicates, and returns the proposal id.
        fn propose(&mut self, leader: u64, request: &Request) -> Result<u64> {
            let id = self.next_proposal;
            self.next_proposal += 1;
            self.node_mut(leader).propose(id, request)?;
            self.deliver_messages()?;
            Ok(id)
        }

        fn reports_for(&self, proposal_id: u64) -> Vec<&ApplyReport> {
            self.reports
                .iter()
                .filter(|report| report.proposal_id == Some(proposal_id))
                .collect()
        }

        fn assert_stores_agree(&self) {
            let reference = self.node(1).store().entries();
            for (&id, node) in &self.nodes {
                assert_eq!(node.store().entries(), reference, "node {id} diverged");
            }
        }
    }

    #[test]
    fn test_basic_three_node_election() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        for id in 1..=3 {
            assert_eq!(cluster.node(id).role(), StateRole::Follower);
            assert_eq!(cluster.node(id).leader_id(), 0);
        }

        cluster.elect(1)?;
        for id in 1..=3 {
            assert_eq!(cluster.node(id).leader_id(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_raw_put_reaches_every_replica() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        let id = cluster.propose(1, &Request::put("color", "blue"))?;

        let reports = cluster.reports_for(id);
        assert_eq!(reports.len(), 3, "each replica reports the entry once");
        assert!(reports.iter().all(|report| report.result.is_ok()));
        for node in 1..=3 {
            assert_eq!(cluster.node(node).value_for(b"color")?, Some(b"blue".to_vec()));
        }
        Ok(())
    }

    #[test]
    fn test_transaction_phases_replicate() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        cluster.propose(1, &Request::put("b", "old"))?;

        let mutations = vec![Mutation::put("a", "1"), Mutation::delete("b")];
        cluster.propose(1, &Request::prepare(mutations.clone(), 30))?;
        for node in 1..=3 {
            assert_eq!(cluster.node(node).locks().locked_keys().len(), 2);
        }

        cluster.propose(1, &Request::commit(mutations))?;
        for node in 1..=3 {
            assert_eq!(cluster.node(node).value_for(b"a")?, Some(b"1".to_vec()));
            assert_eq!(cluster.node(node).value_for(b"b")?, None);
            assert!(cluster.node(node).locks().locked_keys().is_empty());
        }
        cluster.assert_stores_agree();
        Ok(())
    }

    #[test]
    fn test_failed_entry_fails_identically_and_log_moves_on() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        let rejected = cluster.propose(1, &Request::commit(vec![Mutation::put("k", "v")]))?;
        let reports = cluster.reports_for(rejected);
        assert_eq!(reports.len(), 3);
        for report in reports {
            let err = report.result.as_ref().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::KeyNotLocked);
        }

        let accepted = cluster.propose(1, &Request::put("k", "later"))?;
        assert!(cluster.reports_for(accepted).iter().all(|r| r.result.is_ok()));
        cluster.assert_stores_agree();
        Ok(())
    }

    #[test]
    fn test_lagging_follower_catches_up_from_the_log() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        cluster.isolate(3);

        cluster.propose(1, &Request::put("a", "1"))?;
        let mutations = vec![Mutation::put("b", "2")];
        cluster.propose(1, &Request::prepare(mutations.clone(), 30))?;
        cluster.propose(1, &Request::commit(mutations))?;
        assert_eq!(cluster.node(2).value_for(b"b")?, Some(b"2".to_vec()));
        assert_eq!(cluster.node(3).value_for(b"a")?, None);

        cluster.reconnect(3);
        cluster.run_ticks(10)?;

        let lagging = cluster.node(3);
        assert_eq!(lagging.role(), StateRole::Follower);
        assert_eq!(lagging.value_for(b"a")?, Some(b"1".to_vec()));
        assert_eq!(lagging.value_for(b"b")?, Some(b"2".to_vec()));
        assert!(lagging.locks().locked_keys().is_empty());
        cluster.assert_stores_agree();
        Ok(())
    }

    #[test]
    fn test_follower_cannot_propose() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        assert!(cluster.node_mut(2).propose(99, &Request::put("k", "v")).is_err());
        Ok(())
    }

    #[test]
    fn proposal_id_needs_exactly_eight_bytes() {
        assert_eq!(proposal_id(&7u64.to_be_bytes()), Some(7));
        assert_eq!(proposal_id(&[]), None);
        assert_eq!(proposal_id(&[1, 2, 3]), None);
    }
}
