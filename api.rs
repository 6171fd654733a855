//! # Storage backend API
//!
//! A thin, minimal interface for storage backends:
//!
//! - Thin: the smallest set of operations an engine must provide
//! - Simple: avoids type-system complexity and focuses on core functionality
//!
//! Rather than implementing the store's semantics inside each engine, this
//! API exposes low-level ordered-table primitives that the facade builds on.
//! That keeps conditional writes, TTL handling, and batch overlay logic in
//! one place and makes adding an engine adapter a small job.
//!
//! Every backend exposes two logical tables: [`ENTRIES_TABLE`] holds packed
//! record values keyed by `u64`, [`TTL_TABLE`] holds expiration deadlines for
//! the subset of keys that carry one. Both tables live inside the same
//! engine instance so one [`StorageBackend::apply`] call can mutate both
//! atomically.

use crate::error::StoreError;
use std::fmt::Debug;

/// Table holding packed `(term, cmd, data)` values keyed by entry key.
pub const ENTRIES_TABLE: &str = "entries";
/// Table holding expiration deadlines (ms since epoch) keyed by entry key.
pub const TTL_TABLE: &str = "ttl";

/// All tables a backend must provide.
pub const TABLES: [&str; 2] = [ENTRIES_TABLE, TTL_TABLE];

/// Scan direction for range iterators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// One mutation inside an atomic write.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        table: &'static str,
        key: u64,
        value: Vec<u8>,
    },
    Delete {
        table: &'static str,
        key: u64,
    },
}

/// Whole-store estimates reported by engines that track them (LSM engines
/// maintain these as a side effect of compaction bookkeeping).
#[derive(Debug, Clone, Copy)]
pub struct ApproxStats {
    /// Estimated bytes of live data in the entries table.
    pub live_data_bytes: u64,
    /// Estimated number of live keys in the entries table.
    pub key_count: u64,
}

/// Item yielded by a backend range iterator.
pub type RangeItem = Result<(u64, Vec<u8>), StoreError>;

/// Boxed backend cursor over a key range.
pub type RangeIter<'a> = Box<dyn Iterator<Item = RangeItem> + 'a>;

/// The minimal contract an engine adapter implements.
///
/// Implementations should focus on efficient access to the underlying
/// storage; the facade owns all record semantics.
pub trait StorageBackend: Debug + Send + Sync {
    /// Reads the raw value stored under `key`, if any.
    fn get(&self, table: &'static str, key: u64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns a cursor over `[lo, hi]` (both inclusive) in the given
    /// direction. Keys outside the range must not be yielded.
    fn range_iter(
        &self,
        table: &'static str,
        lo: u64,
        hi: u64,
        direction: Direction,
    ) -> Result<RangeIter<'_>, StoreError>;

    /// Applies a group of mutations atomically: either every op in `ops`
    /// becomes durable-visible, or none does.
    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    /// Removes every row from the given table.
    fn clear(&self, table: &'static str) -> Result<(), StoreError>;

    /// Forces committed state onto stable storage.
    fn sync(&self) -> Result<(), StoreError>;

    /// Whole-store estimates for the entries table, when the engine tracks
    /// them cheaply. `None` routes callers to exhaustive iteration.
    fn approx_stats(&self) -> Result<Option<ApproxStats>, StoreError> {
        Ok(None)
    }

    /// Estimated on-disk bytes occupied by entries in `[lo, hi]`.
    fn approx_range_bytes(&self, lo: u64, hi: u64) -> Result<Option<u64>, StoreError> {
        let _ = (lo, hi);
        Ok(None)
    }

    /// Total size of the engine's files, when it is file-backed.
    fn file_size(&self) -> Result<Option<u64>, StoreError> {
        Ok(None)
    }
}
