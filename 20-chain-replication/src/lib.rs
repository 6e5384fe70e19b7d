//! Chain-replicated table.
//!
//! This crate replicates a single logical table of rows across an ordered
//! chain of independent storage backends (Head → Inner* → Tail). Every write
//! enters at the head and travels replica by replica to the tail; a read is
//! served from the tail, which only ever holds committed writes.
//!
//! # Architecture
//!
//! - **Admission** runs on the caller's task: the head's copy is loaded,
//!   the operation validated, and a locked copy written to the head with the
//!   head's concurrency token. Two writers racing for one row both aim at the
//!   same token; the loser gets [`error::ChainError::VersionConflict`].
//! - **Propagation** runs on a spawned Tokio task so that once the head has
//!   accepted a write, nothing the caller does can abandon it half-way.
//! - **Repair** rolls the head's copy forward onto lagging replicas. It runs
//!   before a write that finds an abandoned lock, on a read that finds the
//!   tail behind the head, and from a background worker for writes that
//!   halted mid-chain.
//!
//! Slow replicas are latency, not failure: each hop is bounded by a generous
//! timeout, and only a hop that exceeds it, or fails outright, halts a write.
//!
//! # Modules
//!
//! - [`row`]: row identity, stored copies, and the per-row state machine
//! - [`replica`]: the backend trait and an in-memory backend with fault injection
//! - [`view`]: immutable chain snapshots and head/inner/tail roles
//! - [`table`]: the operation executor
//! - [`repair`]: the repair coordinator and its background worker
//! - [`config`]: timeouts and retry tuning
//! - [`protocol`]: shell command parsing for the `chain` binary

pub mod config;
pub mod error;
mod hop;
pub mod protocol;
pub mod repair;
pub mod replica;
pub mod row;
pub mod table;
pub mod view;

pub use config::TableConfig;
pub use error::{ChainError, ChainResult, ReplicaError};
pub use replica::{Fault, MemoryReplica, Replica};
pub use row::{RowKey, RowRecord, RowState};
pub use table::{ReplicatedTable, WriteOutcome};
pub use view::{ChainView, ViewHandle};
