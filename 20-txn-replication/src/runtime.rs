//! Worker runtime and network handling for transactional Raft nodes.
//!
//! - **Worker thread**: owns the [`RaftNode`], runs the event loop, answers clients
//! - **Network listener thread**: accepts peer connections
//! - **Connection handler threads**: read one framed message each and forward it
//!
//! Everything that touches Raft state happens on the worker; other threads
//! talk to it over crossbeam channels.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use raft::StateRole;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::command::{Mutation, Request};
use crate::config::NodeConfig;
use crate::node::{ApplyReport, RaftNode};

/// Raft logical clock interval.
///
/// Heartbeats go out every 3 ticks (300ms), elections start after 10 (1s).
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How often the worker drops expired locks from memory.
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on one framed peer message.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Handle for sending requests to a running node.
///
/// Cheap to clone; every clone talks to the same worker.
#[derive(Clone)]
pub struct NodeHandle {
    id: u64,
    request_tx: Sender<ClientRequest>,
    proposal_timeout: Duration,
}

impl NodeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replicates a single raw PUT and waits for it to be applied.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.submit(Request::put(key, value))
    }

    /// Replicates a single raw DEL and waits for it to be applied.
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.submit(Request::delete(key))
    }

    /// Proposes `request` and blocks until this node has applied it.
    ///
    /// The error is the entry's [`crate::error::ApplyError`] when the entry
    /// was committed but failed to apply; downcast to inspect its kind.
    /// Fails without proposing when this node is not the leader, and fails
    /// with an unknown outcome if leadership is lost while waiting or the
    /// entry is not applied within the configured proposal timeout. A leader
    /// cut off from its quorum keeps leading, so the timeout is what bounds
    /// the wait there.
    pub fn submit(&self, request: Request) -> Result<()> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Propose {
                request,
                respond_to: resp_tx,
            })
            .context("failed to send propose request")?;
        match resp_rx.recv_timeout(self.proposal_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(anyhow!(
                "proposal not applied within {:?}; outcome unknown",
                self.proposal_timeout
            )),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("propose response channel closed")),
        }
    }

    /// Locks every key of `mutations` for `ttl_secs` seconds.
    pub fn prepare(&self, mutations: Vec<Mutation>, ttl_secs: u64) -> Result<()> {
        self.submit(Request::prepare(mutations, ttl_secs))
    }

    /// Applies `mutations` atomically if all of their keys are still locked.
    pub fn commit(&self, mutations: Vec<Mutation>) -> Result<()> {
        self.submit(Request::commit(mutations))
    }

    /// Releases the locks on `keys`.
    pub fn abort<K: Into<Vec<u8>>>(&self, keys: impl IntoIterator<Item = K>) -> Result<()> {
        self.submit(Request::abort(keys))
    }

    /// Runs a full two-phase commit for `mutations`.
    ///
    /// A failed PREPARE leaves nothing to clean up. A failed COMMIT is
    /// followed by an ABORT of the same keys and the COMMIT error is returned.
    ///
    /// Locks carry no transaction id, so that ABORT releases whatever lock
    /// sits on each key. If our locks expired before the COMMIT and another
    /// client has since prepared one of the keys, the ABORT drops that
    /// client's lock too, and its own COMMIT will fail with `KeyNotLocked`.
    pub fn transact(&self, mutations: Vec<Mutation>, ttl_secs: u64) -> Result<()> {
        self.prepare(mutations.clone(), ttl_secs)
            .context("prepare failed")?;
        if let Err(err) = self.commit(mutations.clone()) {
            let keys: Vec<Vec<u8>> = mutations.into_iter().map(|m| m.key).collect();
            if let Err(abort_err) = self.abort(keys) {
                warn!(node = self.id, error = %abort_err, "abort after failed commit also failed");
            }
            return Err(err.context("commit failed"));
        }
        Ok(())
    }

    /// Reads a value from the local store (no Raft consensus).
    ///
    /// Returns whatever this node has applied so far, so a lagging or
    /// partitioned follower may answer with stale data.
    pub fn get(&self, key: impl Into<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Get {
                key: key.into(),
                respond_to: resp_tx,
            })
            .context("failed to send get request")?;
        resp_rx.recv().context("get response channel closed")?
    }

    /// Retrieves the node's current status (role, leader, store and locks).
    pub fn status(&self) -> Result<NodeStatus> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Status {
                respond_to: resp_tx,
            })
            .context("failed to send status request")?;
        resp_rx.recv().context("status response channel closed")
    }

    /// Forces this node to start an election campaign.
    pub fn campaign(&self) -> Result<String> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Campaign {
                respond_to: resp_tx,
            })
            .context("failed to send campaign request")?;
        resp_rx.recv().context("campaign response channel closed")?
    }

    /// Writes a snapshot of the local store to `path` and returns its size in bytes.
    pub fn snapshot(&self, path: impl Into<PathBuf>) -> Result<usize> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Snapshot {
                path: path.into(),
                respond_to: resp_tx,
            })
            .context("failed to send snapshot request")?;
        resp_rx.recv().context("snapshot response channel closed")?
    }

    /// Signals the worker to shut down. Pending proposals fail.
    pub fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(ClientRequest::Shutdown)
            .context("failed to send shutdown")?;
        Ok(())
    }
}

/// Point-in-time view of a node, returned by [`NodeHandle::status`].
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
    pub store: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Keys holding a live lock.
    pub locked: Vec<Vec<u8>>,
}

enum ClientRequest {
    Propose {
        request: Request,
        respond_to: Sender<Result<()>>,
    },
    Get {
        key: Vec<u8>,
        respond_to: Sender<Result<Option<Vec<u8>>>>,
    },
    Status {
        respond_to: Sender<NodeStatus>,
    },
    Campaign {
        respond_to: Sender<Result<String>>,
    },
    Snapshot {
        path: PathBuf,
        respond_to: Sender<Result<usize>>,
    },
    Shutdown,
}

/// A proposal appended to the log but not yet applied here.
///
/// Matched to its [`ApplyReport`] by proposal id and term. The term guards
/// against an entry from another leader that happens to reuse the same id.
struct Pending {
    term: u64,
    respond_to: Sender<Result<()>>,
}

/// Spawns a node and returns a handle to interact with it.
///
/// Validates the config, restores the store from `restore_from` if set,
/// binds the listener, then starts the worker thread.
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    config.validate()?;
    let span = info_span!("node", id = config.id);

    let mut node = RaftNode::new(config.id, &config.voters())?;
    if let Some(path) = &config.restore_from {
        let file = File::open(path)
            .with_context(|| format!("failed to open snapshot {}", path.display()))?;
        node.restore(BufReader::new(file))
            .with_context(|| format!("failed to restore from {}", path.display()))?;
        info!(parent: &span, path = %path.display(), keys = node.store().len(), "store restored");
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();

    spawn_network_listener(listener, network_tx, span.clone())?;

    let worker_span = span.clone();
    let mut worker = Worker::new(node, config.peers, client_rx, network_rx, span);
    thread::Builder::new()
        .name(format!("raft-worker-{}", config.id))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(parent: &worker_span, error = ?err, "raft worker crashed");
            }
        })
        .context("failed to spawn raft worker")?;

    Ok(NodeHandle {
        id: config.id,
        request_tx: client_tx,
        proposal_timeout: config.proposal_timeout,
    })
}

/// Owns the node and multiplexes client requests, peer messages and ticks.
struct Worker {
    node: RaftNode,
    peers: HashMap<u64, String>,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Message>,
    pending: HashMap<u64, Pending>,
    next_proposal: u64,
    last_role: StateRole,
    span: Span,
}

impl Worker {
    fn new(
        node: RaftNode,
        peers: HashMap<u64, String>,
        client_rx: Receiver<ClientRequest>,
        network_rx: Receiver<Message>,
        span: Span,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            peers,
            client_rx,
            network_rx,
            pending: HashMap::new(),
            next_proposal: 1,
            last_role,
            span,
        }
    }

    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        let mut last_purge = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> msg => {
                    match msg {
                        Ok(msg) => self.node.step(msg)?,
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                last_tick = Instant::now();
            }

            if last_purge.elapsed() >= PURGE_INTERVAL {
                self.node.locks().purge_expired();
                last_purge = Instant::now();
            }

            self.process_ready()?;
            self.track_role_change();
        }

        self.fail_pending("node shut down before the proposal was applied");
        info!(parent: &self.span, "worker stopped");
        Ok(())
    }

    /// Returns `false` once shutdown was requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> Result<bool> {
        match req {
            ClientRequest::Propose {
                request,
                respond_to,
            } => {
                let proposal_id = self.next_proposal;
                self.next_proposal += 1;
                match self.node.propose(proposal_id, &request) {
                    Ok(()) => {
                        debug!(parent: &self.span, proposal_id, kind = request.label(), "proposed");
                        self.pending.insert(
                            proposal_id,
                            Pending {
                                term: self.node.term(),
                                respond_to,
                            },
                        );
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            ClientRequest::Get { key, respond_to } => {
                let _ = respond_to.send(self.node.value_for(&key));
            }
            ClientRequest::Status { respond_to } => {
                let status = NodeStatus {
                    node_id: self.node.id(),
                    role: self.node.role(),
                    leader_id: self.node.leader_id(),
                    term: self.node.term(),
                    store: self.node.store().entries(),
                    locked: self.node.locks().locked_keys(),
                };
                let _ = respond_to.send(status);
            }
            ClientRequest::Campaign { respond_to } => {
                let old_role = self.node.role();
                let result = self.node.campaign().map(|()| {
                    info!(parent: &self.span, ?old_role, "campaign started");
                    format!("Campaign initiated! Previous role: {old_role:?}, starting election...")
                });
                let _ = respond_to.send(result);
            }
            ClientRequest::Snapshot { path, respond_to } => {
                let _ = respond_to.send(self.write_snapshot(&path));
            }
            ClientRequest::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn write_snapshot(&self, path: &Path) -> Result<usize> {
        let snapshot = self.node.snapshot()?;
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut sink = BufWriter::new(file);
        snapshot
            .persist(&mut sink)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(parent: &self.span, path = %path.display(), bytes = snapshot.len(), "snapshot written");
        Ok(snapshot.len())
    }

    /// Drains every ready batch Raft has queued.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.notify(report);
            }
        }
        Ok(())
    }

    /// Steps messages addressed to this node; sends the rest over TCP.
    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }

        let to = msg.to;
        let Some(addr) = self.peers.get(&to) else {
            warn!(parent: &self.span, to, "no address for peer, dropping message");
            return Ok(());
        };
        if let Err(err) = send_message(addr, &msg) {
            debug!(parent: &self.span, to, %addr, error = %err, "failed to send message");
        }
        Ok(())
    }

    /// Answers the client waiting on this entry, if any.
    fn notify(&mut self, report: ApplyReport) {
        match &report.result {
            Ok(()) => debug!(parent: &self.span, index = report.index, term = report.term, "entry applied"),
            Err(err) => info!(parent: &self.span, index = report.index, term = report.term, error = %err, "entry rejected"),
        }

        let Some(proposal_id) = report.proposal_id else {
            return;
        };
        let matches = self
            .pending
            .get(&proposal_id)
            .is_some_and(|pending| pending.term == report.term);
        if !matches {
            return;
        }
        if let Some(pending) = self.pending.remove(&proposal_id) {
            let _ = pending.respond_to.send(report.result.map_err(anyhow::Error::from));
        }
    }

    /// Fails every pending proposal once this node stops leading.
    ///
    /// The entries may still commit under the next leader, so the client
    /// learns only that the outcome is unknown.
    fn track_role_change(&mut self) {
        let current = self.node.role();
        if current == self.last_role {
            return;
        }
        info!(
            parent: &self.span,
            from = ?self.last_role,
            to = ?current,
            leader = self.node.leader_id(),
            term = self.node.term(),
            "role changed"
        );
        if self.last_role == StateRole::Leader {
            self.fail_pending("leadership lost before the proposal was applied; outcome unknown");
        }
        self.last_role = current;
    }

    fn fail_pending(&mut self, reason: &str) {
        if self.pending.is_empty() {
            return;
        }
        warn!(parent: &self.span, count = self.pending.len(), reason, "failing pending proposals");
        for (proposal_id, pending) in self.pending.drain() {
            let _ = pending
                .respond_to
                .send(Err(anyhow!("proposal {proposal_id}: {reason}")));
        }
    }
}

/// Accepts peer connections on a background thread.
///
/// Each connection gets a short-lived handler that reads one message.
fn spawn_network_listener(listener: TcpListener, tx: Sender<Message>, span: Span) -> Result<()> {
    let name = match listener.local_addr() {
        Ok(addr) => format!("raft-net-listener-{addr}"),
        Err(_) => "raft-net-listener".to_string(),
    };
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        let span = span.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(parent: &span, error = %err, "connection error");
                            }
                        });
                    }
                    Err(err) => warn!(parent: &span, error = %err, "accept error"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Reads one length-prefixed Raft message and forwards it to the worker.
///
/// Frame: 4-byte big-endian length, then the protobuf-encoded message.
fn handle_connection(mut stream: TcpStream, tx: Sender<Message>) -> io::Result<()> {
    let msg = read_frame(&mut stream)?;
    tx.send(msg)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Message::decode(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn write_frame<W: Write>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let bytes = msg.encode_to_vec();
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&bytes)
}

/// Sends one message over a fresh connection.
fn send_message(addr: &str, msg: &Message) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    write_frame(&mut stream, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::MessageType;

    #[test]
    fn frames_carry_one_message() -> io::Result<()> {
        let msg = Message {
            msg_type: MessageType::MsgHeartbeat as i32,
            from: 1,
            to: 2,
            term: 7,
            ..Default::default()
        };

        let mut wire = Vec::new();
        write_frame(&mut wire, &msg)?;
        assert_eq!(&wire[..4], &(wire.len() as u32 - 4).to_be_bytes());

        let decoded = read_frame(&mut wire.as_slice())?;
        assert_eq!(decoded.from, 1);
        assert_eq!(decoded.to, 2);
        assert_eq!(decoded.term, 7);
        assert_eq!(decoded.msg_type, MessageType::MsgHeartbeat as i32);
        Ok(())
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = read_frame(&mut wire.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let wire = [0u8, 0, 0, 10, 1, 2];
        assert!(read_frame(&mut &wire[..]).is_err());
    }
}
