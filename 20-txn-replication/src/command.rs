//! Requests that flow through the Raft replicated log.
//!
//! One committed log entry carries exactly one encoded [`Request`]. The types
//! are protobuf messages derived with prost (no build step), so the enum
//! fields travel as raw `i32` codes. A code this version does not know still
//! decodes; the [`Applier`](crate::applier::Applier) rejects it as an unknown
//! request type rather than failing the whole decode.

use prost::Message;

/// Operation carried by a single [`Mutation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Op {
    Put = 0,
    Del = 1,
}

/// Transaction phase of a [`Request`]. Only meaningful when `is_txn` is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Phase {
    None = 0,
    Prepare = 1,
    Commit = 2,
    Abort = 3,
}

/// A single PUT or DELETE on one key.
#[derive(Clone, PartialEq, Message)]
pub struct Mutation {
    #[prost(enumeration = "Op", tag = "1")]
    pub op: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    /// Ignored for deletes.
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Put as i32,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Del as i32,
            key: key.into(),
            value: Vec::new(),
        }
    }

    /// Returns the decoded operation, or `None` for a code this version does not know.
    pub fn known_op(&self) -> Option<Op> {
        Op::from_i32(self.op)
    }
}

/// The decoded form of one log entry.
///
/// A raw request (`is_txn == false`) is a batch of mutations applied in order
/// without rollback. A transactional request is one phase of two-phase
/// commit; `ts` is the lock TTL in seconds for the PREPARE phase.
#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(bool, tag = "1")]
    pub is_txn: bool,
    #[prost(enumeration = "Phase", tag = "2")]
    pub phase: i32,
    #[prost(uint64, tag = "3")]
    pub ts: u64,
    #[prost(message, repeated, tag = "4")]
    pub mutations: Vec<Mutation>,
}

impl Request {
    /// A raw, non-transactional batch.
    pub fn raw(mutations: Vec<Mutation>) -> Self {
        Self {
            is_txn: false,
            phase: Phase::None as i32,
            ts: 0,
            mutations,
        }
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::raw(vec![Mutation::put(key, value)])
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::raw(vec![Mutation::delete(key)])
    }

    /// PREPARE phase: lock every mutation key for `ttl_secs` seconds.
    pub fn prepare(mutations: Vec<Mutation>, ttl_secs: u64) -> Self {
        Self::txn(Phase::Prepare, mutations, ttl_secs)
    }

    /// COMMIT phase: apply the mutations under their locks, then release them.
    pub fn commit(mutations: Vec<Mutation>) -> Self {
        Self::txn(Phase::Commit, mutations, 0)
    }

    /// ABORT phase: release the locks on `keys` without touching the store.
    pub fn abort<K: Into<Vec<u8>>>(keys: impl IntoIterator<Item = K>) -> Self {
        let mutations = keys.into_iter().map(Mutation::delete).collect();
        Self::txn(Phase::Abort, mutations, 0)
    }

    fn txn(phase: Phase, mutations: Vec<Mutation>, ts: u64) -> Self {
        Self {
            is_txn: true,
            phase: phase as i32,
            ts,
            mutations,
        }
    }

    /// Returns the decoded phase, or `None` for a code this version does not know.
    pub fn known_phase(&self) -> Option<Phase> {
        Phase::from_i32(self.phase)
    }

    /// Serializes the request into log entry bytes.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Parses log entry bytes back into a request.
    pub fn decode(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        <Self as Message>::decode(bytes)
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        if !self.is_txn {
            return "raw";
        }
        match self.known_phase() {
            Some(Phase::Prepare) => "prepare",
            Some(Phase::Commit) => "commit",
            Some(Phase::Abort) => "abort",
            Some(Phase::None) | None => "unknown",
        }
    }
}
