//! Raft-replicated key-value store with two-phase-commit transactions.
//!
//! Every write goes through the Raft log as an encoded [`command::Request`].
//! Raw requests apply their mutations directly. Transactional requests run
//! one phase of two-phase commit: PREPARE locks keys for a TTL in a separate
//! lock store, COMMIT applies the mutations atomically if their keys are still
//! locked, ABORT releases the locks. Every replica applies the same entries
//! in the same order with the same outcome.
//!
//! # Architecture
//!
//! - **Main thread**: runs the terminal UI, sends requests to the worker
//! - **Worker thread**: drives the Raft state machine and the applier
//! - **Network listener thread**: accepts Raft messages from peers
//! - **Connection handler threads**: forward each received message to the worker
//!
//! Threads talk over crossbeam channels, so only the worker touches Raft state.
//!
//! # Modules
//!
//! - [`command`]: requests and mutations replicated through the log
//! - [`store`]: the key-value store trait and its in-memory implementation
//! - [`lock_store`]: TTL-bounded lock storage and the clock it expires against
//! - [`applier`]: deterministic state machine applying committed entries
//! - [`error`]: error types surfaced by the stores and the applier
//! - [`node`]: Raft node wrapping tikv/raft around the applier
//! - [`runtime`]: worker loop, peer transport, client handle
//! - [`config`]: node configuration and peer parsing
//! - [`protocol`]: REPL command parsing

pub mod applier;
pub mod command;
pub mod config;
pub mod error;
pub mod lock_store;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod store;
