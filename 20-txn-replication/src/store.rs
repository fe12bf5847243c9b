//! Transactional key-value storage for the replicated state machine.
//!
//! [`Store`] is the contract the [`Applier`](crate::applier::Applier) writes
//! through. [`MemoryStore`] is the reference backing: every node owns one, and
//! Raft makes them converge by applying the same log in the same order.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, Span};

use crate::error::{display_key, StoreError};

/// Handle offered to the body of a [`Store::txn`] call.
///
/// Reads observe the transaction's own staged writes. The handle cannot escape
/// the body, so it is never used after the transaction ends.
pub trait Txn {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;
}

/// A key-addressed byte store with atomic transactions and whole-state snapshots.
///
/// Implementations synchronize internally: readers outside the applier may
/// call `get` at any time and never observe a torn write.
pub trait Store: Send + Sync {
    /// Stable name for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns `Ok(None)` when the key has no entry.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Deleting a missing key succeeds.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Runs `body` atomically: its writes are published together if it
    /// returns `Ok`, and discarded if it returns `Err`.
    fn txn<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Txn) -> Result<T, E>,
        E: From<StoreError>;

    /// Captures the complete state.
    fn snapshot(&self) -> Result<Snapshot, StoreError>;

    /// Replaces the complete state with the one read from `reader`.
    fn restore(&self, reader: &mut dyn Read) -> Result<(), StoreError>;
}

/// Opaque whole-state capture produced by [`Store::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    data: Vec<u8>,
}

impl Snapshot {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes the snapshot to `sink`, e.g. a file shipped to a lagging replica.
    pub fn persist<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        sink.write_all(&self.data)?;
        sink.flush()
    }
}

/// Pending writes of one transaction layered over the committed map.
///
/// `None` marks a staged delete.
pub(crate) struct WriteSet<'a, V> {
    base: &'a BTreeMap<Vec<u8>, V>,
    writes: BTreeMap<Vec<u8>, Option<V>>,
}

impl<'a, V> WriteSet<'a, V> {
    pub(crate) fn new(base: &'a BTreeMap<Vec<u8>, V>) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub(crate) fn read(&self, key: &[u8]) -> Option<&V> {
        match self.writes.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.base.get(key),
        }
    }

    pub(crate) fn stage_put(&mut self, key: &[u8], value: V) {
        self.writes.insert(key.to_vec(), Some(value));
    }

    pub(crate) fn stage_delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    pub(crate) fn into_writes(self) -> BTreeMap<Vec<u8>, Option<V>> {
        self.writes
    }
}

/// Applies a finished write set to the committed map.
pub(crate) fn publish<V>(map: &mut BTreeMap<Vec<u8>, V>, writes: BTreeMap<Vec<u8>, Option<V>>) {
    for (key, staged) in writes {
        match staged {
            Some(value) => {
                map.insert(key, value);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotImageRef<'a> {
    version: u32,
    entries: &'a BTreeMap<Vec<u8>, Vec<u8>>,
}

#[derive(Deserialize)]
struct SnapshotImage {
    version: u32,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// In-memory [`Store`] keyed by the literal key bytes.
///
/// A `BTreeMap` keeps iteration order deterministic, so two replicas holding
/// the same data produce byte-identical snapshots. One reader/writer lock
/// guards the whole map; a transaction holds the write side for its entire body.
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    span: Span,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            span: Span::none(),
        }
    }

    /// Attaches the span that parents this store's log events.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Clones every entry. Used for status output and state comparisons.
    pub fn entries(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.read().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTxn<'a> {
    set: WriteSet<'a, Vec<u8>>,
}

impl Txn for MemoryTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.set.read(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.set.stage_put(key, value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.set.stage_delete(key);
        Ok(())
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        debug!(parent: &self.span, store = self.name(), key = %display_key(key), "put");
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.data.write().remove(key);
        debug!(parent: &self.span, store = self.name(), key = %display_key(key), "delete");
        Ok(())
    }

    fn txn<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Txn) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut data = self.data.write();
        let mut txn = MemoryTxn {
            set: WriteSet::new(&data),
        };
        let out = body(&mut txn)?;
        let writes = txn.set.into_writes();
        let count = writes.len();
        publish(&mut data, writes);
        debug!(parent: &self.span, store = self.name(), writes = count, "transaction committed");
        Ok(out)
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let data = self.data.read();
        let image = SnapshotImageRef {
            version: SNAPSHOT_VERSION,
            entries: &data,
        };
        let bytes = bincode::serialize(&image).map_err(StoreError::SnapshotEncode)?;
        debug!(parent: &self.span, store = self.name(), keys = data.len(), bytes = bytes.len(), "snapshot taken");
        Ok(Snapshot::from_bytes(bytes))
    }

    fn restore(&self, reader: &mut dyn Read) -> Result<(), StoreError> {
        let image: SnapshotImage =
            bincode::deserialize_from(reader).map_err(StoreError::SnapshotDecode)?;
        if image.version != SNAPSHOT_VERSION {
            return Err(StoreError::SnapshotVersion {
                found: image.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        let keys = image.entries.len();
        *self.data.write() = image.entries;
        debug!(parent: &self.span, store = self.name(), keys, "snapshot restored");
        Ok(())
    }
}
