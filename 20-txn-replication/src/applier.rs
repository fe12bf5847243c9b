//! The state machine that replays committed log entries into the stores.
//!
//! Raft hands every committed entry to [`Applier::apply`] exactly once, in log
//! order, on every replica. Applying is deterministic, so replicas that start
//! from the same state and see the same entries end in the same state, errors
//! included.
//!
//! # Request handling
//!
//! - **Raw**: mutations hit the [`Store`] one by one. A failure stops the
//!   batch but earlier mutations stay applied.
//! - **PREPARE**: one lock-store transaction locks every key for `ts`
//!   seconds. Any key that is already locked fails the whole phase and no
//!   lock from it survives.
//! - **COMMIT**: one store transaction applies every mutation, checking
//!   first that its key is still locked. Only after it commits are the locks
//!   released in a second lock-store transaction. A crash between the two
//!   leaves a dangling lock, which blocks the key until expiry or ABORT but
//!   never loses data.
//! - **ABORT**: releases the locks without touching the store. Missing locks
//!   are fine.
//!
//! There is no transaction id; PREPARE, COMMIT and ABORT are correlated only
//! by their key sets and by the order the coordinator appends them.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;

use tracing::{debug, info, warn, Span};

use crate::command::{Mutation, Op, Phase, Request};
use crate::error::{display_key, ApplyError, ErrorKind};
use crate::lock_store::{Clock, SystemClock, TtlStore};
use crate::store::{Snapshot, Store};

pub struct Applier<S, L> {
    store: Arc<S>,
    locks: Arc<L>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl<S: Store, L: TtlStore> Applier<S, L> {
    pub fn new(store: Arc<S>, locks: Arc<L>) -> Self {
        Self {
            store,
            locks,
            clock: Arc::new(SystemClock),
            span: Span::none(),
        }
    }

    /// Replaces the clock used to turn a PREPARE TTL into a deadline.
    ///
    /// Should be the same clock the lock store expires entries with.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches the span that parents this applier's log events.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Shared handle for readers outside the apply path.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<L> {
        &self.locks
    }

    /// Decodes and applies one committed log entry.
    ///
    /// Takes `&mut self` so two entries can never be applied concurrently.
    pub fn apply(&mut self, entry: &[u8]) -> Result<(), ApplyError> {
        let request = match Request::decode(entry) {
            Ok(request) => request,
            Err(err) => {
                warn!(parent: &self.span, bytes = entry.len(), error = %err, "undecodable log entry");
                return Err(err.into());
            }
        };
        self.apply_request(&request)
    }

    /// Applies an already decoded request.
    pub fn apply_request(&mut self, request: &Request) -> Result<(), ApplyError> {
        let result = if request.is_txn {
            self.apply_txn(request)
        } else {
            self.apply_raw(request)
        };

        let kind = request.label();
        let mutations = request.mutations.len();
        match &result {
            Ok(()) => debug!(parent: &self.span, kind, mutations, "request applied"),
            Err(err) => match err.kind() {
                ErrorKind::KeyAlreadyLocked | ErrorKind::KeyNotLocked => {
                    info!(parent: &self.span, kind, mutations, error = %err, "transaction phase rejected")
                }
                _ => warn!(parent: &self.span, kind, mutations, error = %err, "request failed"),
            },
        }
        result
    }

    /// Captures the store. Locks are not part of the snapshot.
    pub fn snapshot(&self) -> Result<Snapshot, ApplyError> {
        Ok(self.store.snapshot()?)
    }

    /// Replaces the store with a snapshot read from `reader`.
    ///
    /// The reader is consumed and dropped on every path.
    pub fn restore<R: Read>(&mut self, mut reader: R) -> Result<(), ApplyError> {
        self.store.restore(&mut reader)?;
        info!(parent: &self.span, store = self.store.name(), "store restored from snapshot");
        Ok(())
    }

    fn apply_raw(&self, request: &Request) -> Result<(), ApplyError> {
        for mutation in &request.mutations {
            match mutation.known_op() {
                Some(Op::Put) => self.store.put(&mutation.key, &mutation.value)?,
                Some(Op::Del) => self.store.delete(&mutation.key)?,
                None => return Err(ApplyError::unknown_op(mutation.op)),
            }
        }
        Ok(())
    }

    fn apply_txn(&self, request: &Request) -> Result<(), ApplyError> {
        match request.known_phase() {
            Some(Phase::Prepare) => self.prepare(request),
            Some(Phase::Commit) => self.commit(request),
            Some(Phase::Abort) => self.release(&request.mutations),
            Some(Phase::None) | None => Err(ApplyError::unknown_phase(request.phase)),
        }
    }

    fn prepare(&self, request: &Request) -> Result<(), ApplyError> {
        let ttl = request.ts;
        let expire_at = self.clock.now_unix_secs().saturating_add(ttl);
        let marker = ttl.to_le_bytes();

        self.locks.txn_with_ttl(|txn| {
            // A key listed twice in one PREPARE is locked once, not reported as a conflict.
            let mut claimed = BTreeSet::new();
            for mutation in &request.mutations {
                if !claimed.insert(mutation.key.as_slice()) {
                    continue;
                }
                if txn.exists(&mutation.key)? {
                    return Err(ApplyError::KeyAlreadyLocked {
                        key: mutation.key.clone(),
                    });
                }
                txn.put_with_ttl(&mutation.key, &marker, expire_at)?;
            }
            Ok(())
        })?;

        debug!(parent: &self.span, keys = request.mutations.len(), expire_at, "locks acquired");
        Ok(())
    }

    fn commit(&self, request: &Request) -> Result<(), ApplyError> {
        self.locks.txn(|lock_txn| {
            self.store.txn(|txn| {
                for mutation in &request.mutations {
                    if !lock_txn.exists(&mutation.key)? {
                        return Err(ApplyError::KeyNotLocked {
                            key: mutation.key.clone(),
                        });
                    }
                    match mutation.known_op() {
                        Some(Op::Put) => txn.put(&mutation.key, &mutation.value)?,
                        Some(Op::Del) => txn.delete(&mutation.key)?,
                        None => return Err(ApplyError::unknown_op(mutation.op)),
                    }
                }
                Ok(())
            })
        })?;

        self.release(&request.mutations)
    }

    /// Deletes the lock of every mutation key in one lock-store transaction.
    fn release(&self, mutations: &[Mutation]) -> Result<(), ApplyError> {
        self.locks.txn(|txn| {
            for mutation in mutations {
                txn.delete(&mutation.key)?;
                debug!(parent: &self.span, key = %display_key(&mutation.key), "lock released");
            }
            Ok::<(), ApplyError>(())
        })
    }
}
