//! TTL-bounded lock storage used by the PREPARE phase of two-phase commit.
//!
//! A lock is an entry whose presence means "reserved by an in-flight
//! transaction". Every lock written through [`TtlTxn::put_with_ttl`] carries
//! an absolute deadline in Unix seconds. [`MemoryLockStore`] expires entries
//! lazily: a read that finds `now > expire_at` treats the entry as absent.
//! Expiry only unblocks abandoned transactions; nothing relies on it for safety.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, Span};

use crate::error::{display_key, StoreError};
use crate::store::{publish, Snapshot, Store, Txn, WriteSet};

/// Source of wall-clock time for lock deadlines.
pub trait Clock: Send + Sync {
    fn now_unix_secs(&self) -> u64;
}

/// Reads the host clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Lets tests step past lock deadlines.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Transaction handle that can also write entries with a deadline.
pub trait TtlTxn: Txn {
    fn put_with_ttl(&mut self, key: &[u8], marker: &[u8], expire_at: u64) -> Result<(), StoreError>;
}

/// A [`Store`] whose transactions may write expiring entries.
pub trait TtlStore: Store {
    fn txn_with_ttl<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn TtlTxn) -> Result<T, E>,
        E: From<StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockEntry {
    marker: Vec<u8>,
    /// `None` for entries written without a TTL.
    expire_at: Option<u64>,
}

impl LockEntry {
    fn is_live(&self, now: u64) -> bool {
        self.expire_at.map_or(true, |deadline| now <= deadline)
    }
}

const LOCK_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct LockImageRef<'a> {
    version: u32,
    entries: &'a BTreeMap<Vec<u8>, LockEntry>,
}

#[derive(Deserialize)]
struct LockImage {
    version: u32,
    entries: BTreeMap<Vec<u8>, LockEntry>,
}

/// In-memory [`TtlStore`] with check-on-read expiry.
pub struct MemoryLockStore {
    data: RwLock<BTreeMap<Vec<u8>, LockEntry>>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            clock,
            span: Span::none(),
        }
    }

    /// Attaches the span that parents this store's log events.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Keys currently holding a live lock.
    pub fn locked_keys(&self) -> Vec<Vec<u8>> {
        let now = self.clock.now_unix_secs();
        self.data
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops expired entries and returns how many were removed.
    ///
    /// Reads already ignore expired entries; this only reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_unix_secs();
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|_, entry| entry.is_live(now));
        let purged = before - data.len();
        if purged > 0 {
            debug!(parent: &self.span, purged, "expired locks purged");
        }
        purged
    }

    fn run_txn<T, E>(&self, body: impl FnOnce(&mut LockTxn<'_>) -> Result<T, E>) -> Result<T, E> {
        let mut data = self.data.write();
        let mut txn = LockTxn {
            set: WriteSet::new(&data),
            now: self.clock.now_unix_secs(),
        };
        let out = body(&mut txn)?;
        let writes = txn.set.into_writes();
        let count = writes.len();
        publish(&mut data, writes);
        debug!(parent: &self.span, store = self.name(), writes = count, "lock transaction committed");
        Ok(out)
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The clock is sampled once per transaction so every check inside one body
/// agrees on what has expired.
struct LockTxn<'a> {
    set: WriteSet<'a, LockEntry>,
    now: u64,
}

impl Txn for LockTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .set
            .read(key)
            .filter(|entry| entry.is_live(self.now))
            .map(|entry| entry.marker.clone()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.set.stage_put(
            key,
            LockEntry {
                marker: value.to_vec(),
                expire_at: None,
            },
        );
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.set.stage_delete(key);
        Ok(())
    }
}

impl TtlTxn for LockTxn<'_> {
    fn put_with_ttl(&mut self, key: &[u8], marker: &[u8], expire_at: u64) -> Result<(), StoreError> {
        self.set.stage_put(
            key,
            LockEntry {
                marker: marker.to_vec(),
                expire_at: Some(expire_at),
            },
        );
        Ok(())
    }
}

impl Store for MemoryLockStore {
    fn name(&self) -> &'static str {
        "memory-lock"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_unix_secs();
        Ok(self
            .data
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.marker.clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let entry = LockEntry {
            marker: value.to_vec(),
            expire_at: None,
        };
        self.data.write().insert(key.to_vec(), entry);
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
        self.run_txn(|txn| body(txn))
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let data = self.data.read();
        let image = LockImageRef {
            version: LOCK_SNAPSHOT_VERSION,
            entries: &data,
        };
        bincode::serialize(&image)
            .map(Snapshot::from_bytes)
            .map_err(StoreError::SnapshotEncode)
    }

    fn restore(&self, reader: &mut dyn Read) -> Result<(), StoreError> {
        let image: LockImage =
            bincode::deserialize_from(reader).map_err(StoreError::SnapshotDecode)?;
        if image.version != LOCK_SNAPSHOT_VERSION {
            return Err(StoreError::SnapshotVersion {
                found: image.version,
                expected: LOCK_SNAPSHOT_VERSION,
            });
        }
        *self.data.write() = image.entries;
        Ok(())
    }
}

impl TtlStore for MemoryLockStore {
    fn txn_with_ttl<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn TtlTxn) -> Result<T, E>,
        E: From<StoreError>,
    {
        self.run_txn(|txn| body(txn))
    }
}
