//! `bwindex` is a latch-free ordered index: a BW-tree of CAS-installed
//! delta chains addressed through a two-level PID table, reclaimed by an
//! epoch-based garbage collector. It supports point insert/delete, a
//! scan over a single key's values, and a full-key scan in leaf order.
//!
//! The index is embedded: there is no wire protocol, on-disk format, or
//! environment-variable configuration surface. Callers supply key and
//! value types and an uniqueness [`bwtree::Mode`]; everything else
//! (logging, tuning constants) follows this crate's own conventions.
//!
//! Durability, crash recovery, transactional MVCC, snapshot-consistent
//! range scans, distribution/replication, and secondary-index rebuild
//! are not implemented -- the index provides concurrency-safe point
//! operations and full-key scan only.

pub mod bwtree;
pub mod error;
pub mod exchange;
pub mod gc;
pub mod pid_table;

pub use crate::bwtree::{Index, Mode};
pub use crate::error::{Error, Result};
pub use crate::exchange::ScanExchange;
pub use crate::gc::{EpochGuard, GarbageCollector};
pub use crate::pid_table::{Pid, PidTable, NULL_PID};

/// Chain-length threshold past which a point operation opportunistically
/// attempts consolidation (spec.md §6).
pub const MAX_CHAIN_LEN: usize = 8;

/// Slot-count threshold past which a consolidated leaf opportunistically
/// attempts a split (spec.md §6).
pub const MAX_NODE_SIZE: usize = 20;

/// Slot-count threshold below which a node would be a merge candidate.
/// Merge is design-only (spec.md §4.3.6); this constant is carried for
/// parity with the environmental parameters spec.md §6 enumerates, and
/// for any future merge implementation to consult.
pub const MIN_NODE_SIZE: usize = MAX_NODE_SIZE / 2;

/// GC daemon cadence, re-exported here alongside the tree's own tunables
/// since spec.md §6 lists them together as one set of environmental
/// parameters.
pub use crate::gc::EPOCH_INTERVAL_MS;
