use crate::api::{
    ApproxStats, Direction, StorageBackend, WriteOp, ENTRIES_TABLE, TTL_TABLE,
};
use crate::backend::in_memory::InMemoryBackend;
#[cfg(feature = "mmap")]
use crate::backend::lmdb::LmdbBackend;
#[cfg(feature = "redb")]
use crate::backend::redb::RedbBackend;
#[cfg(feature = "rocksdb")]
use crate::backend::rocksdb::RocksDbBackend;
use crate::codec;
use crate::config::StoreOptions;
use crate::error::StoreError;
use crate::iter::{EntryIter, MergedRange};
use crate::registry::EngineType;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Hard ceiling on the data blob of a single entry.
pub const MAX_DATA_LEN: usize = 1 << 30; // 1 GiB

/// Current on-disk schema version, recorded next to the engine files.
pub const STORE_SCHEMA_VERSION: u32 = 1;
const STORE_METADATA_FILENAME: &str = "kvidx.version";

/// Estimated key count below which the approximate range count is not worth
/// its error bars and scans run exhaustively instead.
const APPROX_COUNT_THRESHOLD: u64 = 10_000;

/// One stored record.
///
/// `term` and `cmd` are opaque 64-bit metadata slots; the store round-trips
/// them verbatim. Keys are unique and totally ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: u64,
    pub term: u64,
    pub cmd: u64,
    pub data: Bytes,
}

impl Entry {
    pub fn new(key: u64, term: u64, cmd: u64, data: impl Into<Bytes>) -> Self {
        Self {
            key,
            term,
            cmd,
            data: data.into(),
        }
    }
}

/// Conditional-write mode for [`Store::insert_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Unconditionally replace whatever is stored.
    Always,
    /// Fail with `DuplicateKey` if a live entry exists.
    IfAbsent,
    /// Fail with `ConditionFailed` unless a live entry exists.
    IfPresent,
}

/// Outcome of [`Store::compare_and_swap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// No live entry under the key.
    NotFound,
    /// The stored data did not match the expected bytes; nothing changed.
    NoMatch,
    /// The entry was replaced.
    Swapped,
}

/// Result of a TTL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// The key does not exist.
    NotFound,
    /// The key exists and carries no expiration.
    NoExpiry,
    /// Milliseconds until expiration; 0 means expired but not yet reaped.
    Remaining(u64),
}

impl TtlStatus {
    /// Sentinel encoding used by flat wire surfaces: −2 for a missing key,
    /// −1 for a key without TTL, remaining milliseconds otherwise.
    pub fn as_millis(&self) -> i64 {
        match self {
            TtlStatus::NotFound => -2,
            TtlStatus::NoExpiry => -1,
            TtlStatus::Remaining(ms) => *ms as i64,
        }
    }
}

/// Aggregate statistics over the live entries of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub key_count: u64,
    pub min_key: Option<u64>,
    pub max_key: Option<u64>,
    /// Sum of data blob bytes, excluding value headers and the TTL table.
    pub data_size: u64,
    /// Total size of the engine's files, when it is file-backed.
    pub file_size: Option<u64>,
}

/// Pending mutations of an open write batch. `None` slots are tombstones.
#[derive(Debug, Default)]
pub(crate) struct PendingBatch {
    entries: BTreeMap<u64, Option<Vec<u8>>>,
    ttls: BTreeMap<u64, Option<u64>>,
}

impl PendingBatch {
    fn absorb(&mut self, op: WriteOp) {
        match op {
            WriteOp::Put { table, key, value } => {
                if table == TTL_TABLE {
                    self.ttls.insert(key, Some(codec::decode_deadline(&value)));
                } else {
                    self.entries.insert(key, Some(value));
                }
            }
            WriteOp::Delete { table, key } => {
                if table == TTL_TABLE {
                    self.ttls.insert(key, None);
                } else {
                    self.entries.insert(key, None);
                }
            }
        }
    }

    fn into_ops(self) -> Vec<WriteOp> {
        let mut ops = Vec::with_capacity(self.entries.len() + self.ttls.len());
        for (key, slot) in self.entries {
            ops.push(match slot {
                Some(value) => WriteOp::Put {
                    table: ENTRIES_TABLE,
                    key,
                    value,
                },
                None => WriteOp::Delete {
                    table: ENTRIES_TABLE,
                    key,
                },
            });
        }
        for (key, slot) in self.ttls {
            ops.push(match slot {
                Some(deadline) => WriteOp::Put {
                    table: TTL_TABLE,
                    key,
                    value: codec::encode_deadline(deadline),
                },
                None => WriteOp::Delete {
                    table: TTL_TABLE,
                    key,
                },
            });
        }
        ops
    }
}

/// Handle to one opened store.
///
/// Bundles the engine adapter, the optional in-flight write batch, and the
/// path the engine lives at. All operations are synchronous; the handle is
/// intended for a single owner (internal locking only guards the batch).
#[derive(Debug)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
    batch: Mutex<Option<PendingBatch>>,
    engine: EngineType,
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreMetadata {
    schema_version: u32,
}

impl Store {
    /// Opens (or creates) a store at `path` with default options.
    pub fn new(path: impl AsRef<Path>, engine_type: EngineType) -> Result<Self, StoreError> {
        Self::open(path, engine_type, StoreOptions::default())
    }

    /// Opens (or creates) a store at `path` bound to the given engine.
    ///
    /// The registry's path suffix is appended for single-file engines.
    /// Options a backend has no counterpart for are accepted and ignored.
    pub fn open(
        path: impl AsRef<Path>,
        engine_type: EngineType,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let info = engine_type.info();
        let data_path = apply_path_suffix(path.as_ref(), info.path_suffix);

        if engine_type != EngineType::InMemory {
            validate_store_schema_version(&data_path, info.path_suffix)?;
        }

        let backend: Arc<dyn StorageBackend> = match engine_type {
            EngineType::InMemory => Arc::new(InMemoryBackend::open()),
            #[cfg(feature = "rocksdb")]
            EngineType::RocksDB => Arc::new(RocksDbBackend::open(&data_path, &options)?),
            #[cfg(feature = "redb")]
            EngineType::Redb => Arc::new(RedbBackend::open(&data_path, &options)?),
            #[cfg(feature = "mmap")]
            EngineType::Lmdb => Arc::new(LmdbBackend::open(&data_path, &options)?),
        };

        debug!(engine = info.name, path = %data_path.display(), "opened store");
        Ok(Self {
            backend,
            batch: Mutex::new(None),
            engine: engine_type,
            path: data_path,
        })
    }

    /// Closes the store, discarding any uncommitted batch.
    pub fn close(self) -> Result<(), StoreError> {
        debug!(path = %self.path.display(), "closing store");
        Ok(())
    }

    /// Forces all committed state onto stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.backend.sync()
    }

    pub fn engine(&self) -> EngineType {
        self.engine
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------

    /// Starts a write batch. A second `begin` while one is active is a no-op.
    pub fn begin(&self) -> Result<(), StoreError> {
        let mut guard = self.batch_guard()?;
        if guard.is_none() {
            *guard = Some(PendingBatch::default());
        }
        Ok(())
    }

    /// Atomically applies the active batch. Without one, succeeds as a no-op.
    ///
    /// A failed commit discards the batch.
    pub fn commit(&self) -> Result<(), StoreError> {
        let staged = self.batch_guard()?.take();
        let Some(batch) = staged else {
            return Ok(());
        };
        let ops = batch.into_ops();
        if ops.is_empty() {
            return Ok(());
        }
        self.backend.apply(ops)
    }

    /// Discards the active batch. Without one, succeeds as a no-op.
    pub fn abort(&self) -> Result<(), StoreError> {
        self.batch_guard()?.take();
        Ok(())
    }

    /// Whether a write batch is currently active.
    pub fn batch_active(&self) -> Result<bool, StoreError> {
        Ok(self.batch_guard()?.is_some())
    }

    // ------------------------------------------------------------------
    // Point operations
    // ------------------------------------------------------------------

    /// Reads the entry stored under `key`, if it is live.
    pub fn get(&self, key: u64) -> Result<Option<Entry>, StoreError> {
        let now = now_ms();
        Ok(self
            .live_entry(key, now)?
            .map(|packed| unpack_entry(key, &packed)))
    }

    pub fn exists(&self, key: u64) -> Result<bool, StoreError> {
        Ok(self.live_entry(key, now_ms())?.is_some())
    }

    /// True iff a live entry exists under `key` and its term matches.
    pub fn exists_with_term(&self, key: u64, term: u64) -> Result<bool, StoreError> {
        match self.live_entry(key, now_ms())? {
            Some(packed) => {
                let (stored_term, _, _) = codec::unpack_value(&packed);
                Ok(stored_term == term)
            }
            None => Ok(false),
        }
    }

    /// Strict insert: fails with `DuplicateKey` if a live entry exists.
    /// An expired-but-unreaped entry counts as absent and is replaced.
    pub fn insert(&self, key: u64, term: u64, cmd: u64, data: &[u8]) -> Result<(), StoreError> {
        self.insert_with(key, term, cmd, data, InsertMode::IfAbsent)
    }

    /// Conditional insert; see [`InsertMode`].
    pub fn insert_with(
        &self,
        key: u64,
        term: u64,
        cmd: u64,
        data: &[u8],
        mode: InsertMode,
    ) -> Result<(), StoreError> {
        check_data_len(data.len())?;
        let now = now_ms();
        let live = self.live_entry(key, now)?.is_some();
        match mode {
            InsertMode::IfAbsent if live => return Err(StoreError::DuplicateKey),
            InsertMode::IfPresent if !live => return Err(StoreError::ConditionFailed),
            _ => {}
        }

        let mut ops = vec![WriteOp::Put {
            table: ENTRIES_TABLE,
            key,
            value: codec::pack_value(term, cmd, data),
        }];
        // A creation must not inherit a stale or orphaned deadline
        if !live && self.ttl_deadline(key)?.is_some() {
            ops.push(WriteOp::Delete {
                table: TTL_TABLE,
                key,
            });
        }
        self.stage(ops)
    }

    /// Removes the entry (and its TTL record). Removing an absent key is Ok.
    pub fn remove(&self, key: u64) -> Result<(), StoreError> {
        self.stage(vec![
            WriteOp::Delete {
                table: ENTRIES_TABLE,
                key,
            },
            WriteOp::Delete {
                table: TTL_TABLE,
                key,
            },
        ])
    }

    // ------------------------------------------------------------------
    // Navigation and scans
    // ------------------------------------------------------------------

    pub fn min_key(&self) -> Result<Option<u64>, StoreError> {
        Ok(self
            .range(.., Direction::Forward)?
            .next()
            .transpose()?
            .map(|entry| entry.key))
    }

    pub fn max_key(&self) -> Result<Option<u64>, StoreError> {
        Ok(self
            .range(.., Direction::Reverse)?
            .next()
            .transpose()?
            .map(|entry| entry.key))
    }

    /// Smallest live entry with key strictly greater than `key`.
    pub fn next_after(&self, key: u64) -> Result<Option<Entry>, StoreError> {
        let Some(lo) = key.checked_add(1) else {
            return Ok(None);
        };
        self.range(lo.., Direction::Forward)?.next().transpose()
    }

    /// Largest live entry with key strictly less than `key`.
    ///
    /// `prev_before(u64::MAX)` is the "last entry" sentinel and includes a
    /// record stored at `u64::MAX` itself.
    pub fn prev_before(&self, key: u64) -> Result<Option<Entry>, StoreError> {
        if key == u64::MAX {
            return self.range(.., Direction::Reverse)?.next().transpose();
        }
        let Some(hi) = key.checked_sub(1) else {
            return Ok(None);
        };
        self.range(..=hi, Direction::Reverse)?.next().transpose()
    }

    /// Cursor over the live entries of `bounds` in the given direction.
    pub fn range(
        &self,
        bounds: impl RangeBounds<u64>,
        direction: Direction,
    ) -> Result<EntryIter<'_>, StoreError> {
        let now = now_ms();
        match resolve_bounds(&bounds) {
            Some((lo, hi)) => {
                let inner = self.merged_range(ENTRIES_TABLE, lo, hi, direction)?;
                Ok(EntryIter::new(self, inner, now))
            }
            None => {
                let inner = MergedRange::new(Box::new(std::iter::empty()), Vec::new(), direction);
                Ok(EntryIter::new(self, inner, now))
            }
        }
    }

    /// Forward cursor over every live entry.
    pub fn iter(&self) -> Result<EntryIter<'_>, StoreError> {
        self.range(.., Direction::Forward)
    }

    // ------------------------------------------------------------------
    // Range mutations
    // ------------------------------------------------------------------

    /// Deletes every entry within `bounds`; returns how many live entries
    /// were removed. TTL records in the range are deleted alongside.
    pub fn remove_range(&self, bounds: impl RangeBounds<u64>) -> Result<u64, StoreError> {
        let Some((lo, hi)) = resolve_bounds(&bounds) else {
            return Ok(0);
        };
        let now = now_ms();

        let rows: Vec<u64> = self
            .merged_range(ENTRIES_TABLE, lo, hi, Direction::Forward)?
            .map(|row| row.map(|(key, _)| key))
            .collect::<Result<_, _>>()?;
        let ttl_rows: Vec<u64> = self
            .merged_range(TTL_TABLE, lo, hi, Direction::Forward)?
            .map(|row| row.map(|(key, _)| key))
            .collect::<Result<_, _>>()?;

        let mut deleted = 0u64;
        let mut ops = Vec::with_capacity(rows.len() + ttl_rows.len());
        for key in rows {
            if !self.expired(key, now)? {
                deleted += 1;
            }
            ops.push(WriteOp::Delete {
                table: ENTRIES_TABLE,
                key,
            });
        }
        for key in ttl_rows {
            ops.push(WriteOp::Delete {
                table: TTL_TABLE,
                key,
            });
        }
        if !ops.is_empty() {
            self.stage(ops)?;
        }
        Ok(deleted)
    }

    /// Deletes every entry with key ≥ `key` (log truncation from the tail).
    pub fn truncate_from(&self, key: u64) -> Result<u64, StoreError> {
        self.remove_range(key..)
    }

    /// Deletes every entry with key ≤ `key` (log compaction from the head).
    pub fn truncate_through(&self, key: u64) -> Result<u64, StoreError> {
        self.remove_range(..=key)
    }

    // ------------------------------------------------------------------
    // Atomic read-modify-write
    // ------------------------------------------------------------------

    /// Writes the new value and returns the previous live entry, if any.
    pub fn replace(
        &self,
        key: u64,
        term: u64,
        cmd: u64,
        data: &[u8],
    ) -> Result<Option<Entry>, StoreError> {
        check_data_len(data.len())?;
        let now = now_ms();
        let old = self
            .live_entry(key, now)?
            .map(|packed| unpack_entry(key, &packed));

        let mut ops = vec![WriteOp::Put {
            table: ENTRIES_TABLE,
            key,
            value: codec::pack_value(term, cmd, data),
        }];
        if old.is_none() && self.ttl_deadline(key)?.is_some() {
            ops.push(WriteOp::Delete {
                table: TTL_TABLE,
                key,
            });
        }
        self.stage(ops)?;
        Ok(old)
    }

    /// Removes and returns the live entry, cascading its TTL record.
    pub fn take(&self, key: u64) -> Result<Option<Entry>, StoreError> {
        let now = now_ms();
        let Some(packed) = self.live_entry(key, now)? else {
            return Ok(None);
        };
        let entry = unpack_entry(key, &packed);
        self.stage(vec![
            WriteOp::Delete {
                table: ENTRIES_TABLE,
                key,
            },
            WriteOp::Delete {
                table: TTL_TABLE,
                key,
            },
        ])?;
        Ok(Some(entry))
    }

    /// Replaces the entry only if its current data equals `expected`.
    /// Term and cmd are not part of the comparison.
    pub fn compare_and_swap(
        &self,
        key: u64,
        expected: &[u8],
        term: u64,
        cmd: u64,
        data: &[u8],
    ) -> Result<CasOutcome, StoreError> {
        check_data_len(data.len())?;
        let now = now_ms();
        let Some(packed) = self.live_entry(key, now)? else {
            return Ok(CasOutcome::NotFound);
        };
        let (_, _, current) = codec::unpack_value(&packed);
        if current != expected {
            return Ok(CasOutcome::NoMatch);
        }
        self.stage(vec![WriteOp::Put {
            table: ENTRIES_TABLE,
            key,
            value: codec::pack_value(term, cmd, data),
        }])?;
        Ok(CasOutcome::Swapped)
    }

    /// Appends `suffix` to the entry's data, creating the entry when absent.
    /// Returns the new data length.
    pub fn append(&self, key: u64, term: u64, cmd: u64, suffix: &[u8]) -> Result<u64, StoreError> {
        self.splice(key, term, cmd, suffix, true)
    }

    /// Prepends `prefix` to the entry's data, creating the entry when absent.
    /// Returns the new data length.
    pub fn prepend(&self, key: u64, term: u64, cmd: u64, prefix: &[u8]) -> Result<u64, StoreError> {
        self.splice(key, term, cmd, prefix, false)
    }

    fn splice(
        &self,
        key: u64,
        term: u64,
        cmd: u64,
        fragment: &[u8],
        at_end: bool,
    ) -> Result<u64, StoreError> {
        let now = now_ms();
        match self.live_entry(key, now)? {
            Some(packed) => {
                let (_, _, old) = codec::unpack_value(&packed);
                check_data_len(old.len().saturating_add(fragment.len()))?;
                let mut data = Vec::with_capacity(old.len() + fragment.len());
                if at_end {
                    data.extend_from_slice(old);
                    data.extend_from_slice(fragment);
                } else {
                    data.extend_from_slice(fragment);
                    data.extend_from_slice(old);
                }
                let new_len = data.len() as u64;
                self.stage(vec![WriteOp::Put {
                    table: ENTRIES_TABLE,
                    key,
                    value: codec::pack_value(term, cmd, &data),
                }])?;
                Ok(new_len)
            }
            None => {
                check_data_len(fragment.len())?;
                let mut ops = vec![WriteOp::Put {
                    table: ENTRIES_TABLE,
                    key,
                    value: codec::pack_value(term, cmd, fragment),
                }];
                if self.ttl_deadline(key)?.is_some() {
                    ops.push(WriteOp::Delete {
                        table: TTL_TABLE,
                        key,
                    });
                }
                self.stage(ops)?;
                Ok(fragment.len() as u64)
            }
        }
    }

    // ------------------------------------------------------------------
    // Partial value access
    // ------------------------------------------------------------------

    /// Reads `len` bytes of the entry's data starting at `offset`.
    /// `len == 0` reads to the end; an offset past the end reads empty.
    pub fn read_at(&self, key: u64, offset: u64, len: u64) -> Result<Bytes, StoreError> {
        let Some(packed) = self.live_entry(key, now_ms())? else {
            return Err(StoreError::NotFound);
        };
        let (_, _, data) = codec::unpack_value(&packed);
        let total = data.len() as u64;
        if offset >= total {
            return Ok(Bytes::new());
        }
        let end = if len == 0 {
            total
        } else {
            total.min(offset.saturating_add(len))
        };
        Ok(Bytes::copy_from_slice(&data[offset as usize..end as usize]))
    }

    /// Overwrites the entry's data at `offset`, growing it as needed and
    /// zero-filling any gap between the old end and `offset`. Returns the
    /// new data length. The key must exist.
    pub fn write_at(&self, key: u64, offset: u64, bytes: &[u8]) -> Result<u64, StoreError> {
        let Some(packed) = self.live_entry(key, now_ms())? else {
            return Err(StoreError::NotFound);
        };
        let (term, cmd, old) = codec::unpack_value(&packed);
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| StoreError::InvalidArgument("offset + length overflows".into()))?;
        let new_len = end.max(old.len() as u64);
        check_data_len(new_len as usize)?;

        let mut data = vec![0u8; new_len as usize];
        data[..old.len()].copy_from_slice(old);
        data[offset as usize..end as usize].copy_from_slice(bytes);
        self.stage(vec![WriteOp::Put {
            table: ENTRIES_TABLE,
            key,
            value: codec::pack_value(term, cmd, &data),
        }])?;
        Ok(new_len)
    }

    // ------------------------------------------------------------------
    // Batch insertion
    // ------------------------------------------------------------------

    /// Inserts entries in order, stopping at the first duplicate; returns
    /// how many were inserted. Under an active batch the writes commit
    /// atomically with it; otherwise each insert auto-commits.
    pub fn insert_batch(&self, entries: &[Entry]) -> Result<u64, StoreError> {
        self.insert_batch_filtered(entries, |_, _| true)
    }

    /// [`Store::insert_batch`] with a predicate filtering which entries are
    /// attempted; skipped entries neither count nor stop the loop.
    pub fn insert_batch_filtered(
        &self,
        entries: &[Entry],
        mut predicate: impl FnMut(usize, &Entry) -> bool,
    ) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for (index, entry) in entries.iter().enumerate() {
            if !predicate(index, entry) {
                continue;
            }
            match self.insert(entry.key, entry.term, entry.cmd, &entry.data) {
                Ok(()) => inserted += 1,
                Err(StoreError::DuplicateKey) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }

    // ------------------------------------------------------------------
    // Statistics and range queries
    // ------------------------------------------------------------------

    /// Number of live entries. Agrees with exhaustive iteration.
    pub fn key_count(&self) -> Result<u64, StoreError> {
        let mut count = 0u64;
        for entry in self.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Sum of live data blob bytes (headers and TTL records excluded).
    pub fn data_size(&self) -> Result<u64, StoreError> {
        let mut size = 0u64;
        for entry in self.iter()? {
            size = size.saturating_add(entry?.data.len() as u64);
        }
        Ok(size)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.iter()?.next().transpose()?.is_none())
    }

    /// One-pass aggregate of count, bounds, and data size.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for entry in self.iter()? {
            let entry = entry?;
            stats.key_count += 1;
            stats.data_size = stats.data_size.saturating_add(entry.data.len() as u64);
            if stats.min_key.is_none() {
                stats.min_key = Some(entry.key);
            }
            stats.max_key = Some(entry.key);
        }
        stats.file_size = self.backend.file_size()?;
        Ok(stats)
    }

    /// Number of live entries within `bounds` (inclusive resolution).
    ///
    /// On large non-transactional stores this may take an approximate fast
    /// path driven by the engine's size estimates; exhaustive iteration is
    /// the correctness reference and the fallback.
    pub fn count_range(&self, bounds: impl RangeBounds<u64>) -> Result<u64, StoreError> {
        let Some((lo, hi)) = resolve_bounds(&bounds) else {
            return Ok(0);
        };

        if !self.batch_active()? {
            if let Some(estimate) = self.approximate_count(lo, hi)? {
                return Ok(estimate);
            }
        }

        let mut count = 0u64;
        for entry in self.range(lo..=hi, Direction::Forward)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn approximate_count(&self, lo: u64, hi: u64) -> Result<Option<u64>, StoreError> {
        let Some(ApproxStats {
            live_data_bytes,
            key_count,
        }) = self.backend.approx_stats()?
        else {
            return Ok(None);
        };
        if key_count < APPROX_COUNT_THRESHOLD || live_data_bytes == 0 {
            return Ok(None);
        }
        let Some(range_bytes) = self.backend.approx_range_bytes(lo, hi)? else {
            return Ok(None);
        };
        if range_bytes == 0 {
            debug!("range size estimate empty, counting exhaustively");
            return Ok(None);
        }
        // round(range_bytes / (live_bytes / keys)) without intermediate loss
        let scaled = (range_bytes as u128 * key_count as u128 + live_data_bytes as u128 / 2)
            / live_data_bytes as u128;
        Ok(Some(scaled.min(u64::MAX as u128) as u64))
    }

    /// True iff at least one live entry falls within `bounds`.
    pub fn exists_in_range(&self, bounds: impl RangeBounds<u64>) -> Result<bool, StoreError> {
        Ok(self
            .range(bounds, Direction::Forward)?
            .next()
            .transpose()?
            .is_some())
    }

    // ------------------------------------------------------------------
    // TTL
    // ------------------------------------------------------------------

    /// Attaches an expiration `ttl_ms` milliseconds from now. The key must
    /// be live.
    pub fn expire_after(&self, key: u64, ttl_ms: u64) -> Result<(), StoreError> {
        self.expire_at(key, now_ms().saturating_add(ttl_ms))
    }

    /// Attaches an absolute expiration timestamp. The key must be live.
    pub fn expire_at(&self, key: u64, when_ms: u64) -> Result<(), StoreError> {
        if self.live_entry(key, now_ms())?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.stage(vec![WriteOp::Put {
            table: TTL_TABLE,
            key,
            value: codec::encode_deadline(when_ms),
        }])
    }

    /// Queries the TTL state of `key`; see [`TtlStatus`].
    pub fn ttl(&self, key: u64) -> Result<TtlStatus, StoreError> {
        let now = now_ms();
        if self.raw_entry(key)?.is_none() {
            return Ok(TtlStatus::NotFound);
        }
        match self.ttl_deadline(key)? {
            None => Ok(TtlStatus::NoExpiry),
            Some(deadline) => Ok(TtlStatus::Remaining(deadline.saturating_sub(now))),
        }
    }

    /// Removes the expiration from a live key, making it permanent again.
    pub fn persist(&self, key: u64) -> Result<(), StoreError> {
        if self.live_entry(key, now_ms())?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.stage(vec![WriteOp::Delete {
            table: TTL_TABLE,
            key,
        }])
    }

    /// Reaps up to `max_keys` expired entries (0 = all currently expired),
    /// deleting each TTL record together with its entry in one atomic write.
    /// Orphaned records whose entry is already gone are reaped the same way.
    pub fn expire_scan(&self, max_keys: usize) -> Result<u64, StoreError> {
        let now = now_ms();
        let mut expired = Vec::new();
        for row in self.merged_range(TTL_TABLE, 0, u64::MAX, Direction::Forward)? {
            let (key, raw) = row?;
            if codec::decode_deadline(&raw) <= now {
                expired.push(key);
                if max_keys != 0 && expired.len() >= max_keys {
                    break;
                }
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }
        let mut ops = Vec::with_capacity(expired.len() * 2);
        for &key in &expired {
            ops.push(WriteOp::Delete {
                table: TTL_TABLE,
                key,
            });
            ops.push(WriteOp::Delete {
                table: ENTRIES_TABLE,
                key,
            });
        }
        self.stage(ops)?;
        let reaped = expired.len() as u64;
        debug!(reaped, "expire scan finished");
        Ok(reaped)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Immediately removes every entry and TTL record, including any staged
    /// in the active batch.
    pub fn clear(&self) -> Result<(), StoreError> {
        {
            let mut guard = self.batch_guard()?;
            if let Some(batch) = guard.as_mut() {
                *batch = PendingBatch::default();
            }
        }
        self.backend.clear(ENTRIES_TABLE)?;
        self.backend.clear(TTL_TABLE)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn batch_guard(&self) -> Result<MutexGuard<'_, Option<PendingBatch>>, StoreError> {
        self.batch.lock().map_err(|_| StoreError::LockError)
    }

    /// Batch-overlaid point read of the packed value, without the TTL check.
    fn raw_entry(&self, key: u64) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(batch) = self.batch_guard()?.as_ref() {
            if let Some(slot) = batch.entries.get(&key) {
                return Ok(slot.clone());
            }
        }
        self.backend.get(ENTRIES_TABLE, key)
    }

    /// Batch-overlaid TTL deadline lookup.
    pub(crate) fn ttl_deadline(&self, key: u64) -> Result<Option<u64>, StoreError> {
        if let Some(batch) = self.batch_guard()?.as_ref() {
            if let Some(slot) = batch.ttls.get(&key) {
                return Ok(*slot);
            }
        }
        Ok(self
            .backend
            .get(TTL_TABLE, key)?
            .map(|raw| codec::decode_deadline(&raw)))
    }

    fn expired(&self, key: u64, now: u64) -> Result<bool, StoreError> {
        Ok(matches!(self.ttl_deadline(key)?, Some(deadline) if deadline <= now))
    }

    /// Packed value of `key` if the entry exists and has not expired.
    fn live_entry(&self, key: u64, now: u64) -> Result<Option<Vec<u8>>, StoreError> {
        match self.raw_entry(key)? {
            Some(packed) if !self.expired(key, now)? => Ok(Some(packed)),
            _ => Ok(None),
        }
    }

    /// Routes mutations into the active batch, or applies them atomically
    /// right away in auto-commit mode.
    fn stage(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut guard = self.batch_guard()?;
        match guard.as_mut() {
            Some(batch) => {
                for op in ops {
                    batch.absorb(op);
                }
                Ok(())
            }
            None => {
                drop(guard);
                self.backend.apply(ops)
            }
        }
    }

    /// Batch-overlaid cursor over one table, ordered in `direction`.
    pub(crate) fn merged_range(
        &self,
        table: &'static str,
        lo: u64,
        hi: u64,
        direction: Direction,
    ) -> Result<MergedRange<'_>, StoreError> {
        let overlay: Vec<(u64, Option<Vec<u8>>)> = {
            let guard = self.batch_guard()?;
            match guard.as_ref() {
                Some(batch) => {
                    let rows: Box<dyn Iterator<Item = (u64, Option<Vec<u8>>)>> =
                        if table == TTL_TABLE {
                            Box::new(
                                batch
                                    .ttls
                                    .range(lo..=hi)
                                    .map(|(k, v)| (*k, v.map(codec::encode_deadline))),
                            )
                        } else {
                            Box::new(batch.entries.range(lo..=hi).map(|(k, v)| (*k, v.clone())))
                        };
                    match direction {
                        Direction::Forward => rows.collect(),
                        Direction::Reverse => {
                            let mut collected: Vec<_> = rows.collect();
                            collected.reverse();
                            collected
                        }
                    }
                }
                None => Vec::new(),
            }
        };
        let base = self.backend.range_iter(table, lo, hi, direction)?;
        Ok(MergedRange::new(base, overlay, direction))
    }
}

fn unpack_entry(key: u64, packed: &[u8]) -> Entry {
    let (term, cmd, data) = codec::unpack_value(packed);
    Entry::new(key, term, cmd, Bytes::copy_from_slice(data))
}

fn check_data_len(len: usize) -> Result<(), StoreError> {
    if len > MAX_DATA_LEN {
        return Err(StoreError::InvalidArgument(format!(
            "data length {len} exceeds maximum {MAX_DATA_LEN}"
        )));
    }
    Ok(())
}

/// Resolves arbitrary bounds to an inclusive `[lo, hi]` pair; `None` means
/// the range is empty.
fn resolve_bounds(bounds: &impl RangeBounds<u64>) -> Option<(u64, u64)> {
    let lo = match bounds.start_bound() {
        Bound::Unbounded => 0,
        Bound::Included(&k) => k,
        Bound::Excluded(&k) => k.checked_add(1)?,
    };
    let hi = match bounds.end_bound() {
        Bound::Unbounded => u64::MAX,
        Bound::Included(&k) => k,
        Bound::Excluded(&k) => k.checked_sub(1)?,
    };
    (lo <= hi).then_some((lo, hi))
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn apply_path_suffix(path: &Path, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        path.to_path_buf()
    } else {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(suffix);
        PathBuf::from(raw)
    }
}

/// Checks that the on-disk schema version matches this build, creating the
/// metadata file for a fresh store. A populated store without one is from
/// an unknown vintage and is rejected rather than silently reinterpreted.
fn validate_store_schema_version(data_path: &Path, suffix: &str) -> Result<(), StoreError> {
    let metadata_path = if suffix.is_empty() {
        data_path.join(STORE_METADATA_FILENAME)
    } else {
        data_path.with_extension("version")
    };

    if !metadata_path.exists() {
        let occupied = if suffix.is_empty() {
            data_path.exists() && !dir_is_empty(data_path)?
        } else {
            data_path.exists()
        };
        if occupied {
            return Err(StoreError::MissingStoreVersion {
                expected: STORE_SCHEMA_VERSION,
            });
        }
        init_metadata_file(&metadata_path, suffix.is_empty().then_some(data_path))?;
        return Ok(());
    }

    let file_contents = std::fs::read_to_string(metadata_path)?;
    let metadata: StoreMetadata = serde_json::from_str(&file_contents)?;
    if metadata.schema_version != STORE_SCHEMA_VERSION {
        return Err(StoreError::IncompatibleStoreVersion {
            found: metadata.schema_version,
            expected: STORE_SCHEMA_VERSION,
        });
    }
    Ok(())
}

fn init_metadata_file(metadata_path: &Path, data_dir: Option<&Path>) -> Result<(), StoreError> {
    match data_dir {
        Some(dir) => std::fs::create_dir_all(dir)?,
        None => {
            if let Some(parent) = metadata_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
    }
    info!(path = %metadata_path.display(), "initializing store metadata");
    let metadata = StoreMetadata {
        schema_version: STORE_SCHEMA_VERSION,
    };
    let serialized = serde_json::to_string_pretty(&metadata)?;
    let mut file = std::fs::File::create_new(metadata_path)?;
    file.write_all(serialized.as_bytes())?;
    Ok(())
}

fn dir_is_empty(path: &Path) -> Result<bool, StoreError> {
    Ok(std::fs::read_dir(path)?.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportOptions, ImportOptions};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempdir::TempDir;

    #[test]
    fn test_in_memory_store() {
        test_store_suite(EngineType::InMemory);
    }

    #[cfg(feature = "rocksdb")]
    #[test]
    fn test_rocksdb_store() {
        test_store_suite(EngineType::RocksDB);
    }

    #[cfg(feature = "redb")]
    #[test]
    fn test_redb_store() {
        test_store_suite(EngineType::Redb);
    }

    #[cfg(feature = "mmap")]
    #[test]
    fn test_lmdb_store() {
        test_store_suite(EngineType::Lmdb);
    }

    // Creates an empty store in a fresh directory, runs the test, and lets
    // the tempdir clean up afterwards
    fn run_test(test_func: fn(Store), engine_type: EngineType) {
        let dir = TempDir::new("kvidx-store-test").expect("create test dir");
        let store =
            Store::new(dir.path().join("store"), engine_type).expect("failed to create test db");
        test_func(store);
    }

    fn test_store_suite(engine_type: EngineType) {
        run_test(test_insert_get_roundtrip, engine_type);
        run_test(test_duplicate_insert_rejected, engine_type);
        run_test(test_insert_modes, engine_type);
        run_test(test_remove_and_reinsert, engine_type);
        run_test(test_navigation, engine_type);
        run_test(test_iteration_sorted_random, engine_type);
        run_test(test_monotonic_queue, engine_type);
        run_test(test_compare_and_swap, engine_type);
        run_test(test_append_prepend, engine_type);
        run_test(test_read_write_at, engine_type);
        run_test(test_ttl_expiration, engine_type);
        run_test(test_ttl_status, engine_type);
        run_test(test_expired_key_behaves_absent, engine_type);
        run_test(test_expire_scan_limits, engine_type);
        run_test(test_orphan_ttl_reaped, engine_type);
        run_test(test_transactions, engine_type);
        run_test(test_batch_overlay, engine_type);
        run_test(test_range_truncation, engine_type);
        run_test(test_remove_range, engine_type);
        run_test(test_insert_batch, engine_type);
        run_test(test_statistics, engine_type);
        run_test(test_count_range, engine_type);
        run_test(test_replace_and_take, engine_type);
        run_test(test_clear, engine_type);
        run_test(test_binary_dump_roundtrip, engine_type);
    }

    fn test_insert_get_roundtrip(store: Store) {
        store.insert(1, 7, 9, b"hello").unwrap();
        let entry = store.get(1).unwrap().unwrap();
        assert_eq!(entry.key, 1);
        assert_eq!(entry.term, 7);
        assert_eq!(entry.cmd, 9);
        assert_eq!(&entry.data[..], b"hello");

        assert!(store.get(2).unwrap().is_none());
        assert!(store.exists(1).unwrap());
        assert!(!store.exists(2).unwrap());
        assert!(store.exists_with_term(1, 7).unwrap());
        assert!(!store.exists_with_term(1, 8).unwrap());

        // Empty data round-trips too
        store.insert(2, 0, 0, b"").unwrap();
        assert!(store.get(2).unwrap().unwrap().data.is_empty());
    }

    fn test_duplicate_insert_rejected(store: Store) {
        store.insert(5, 1, 1, b"first").unwrap();
        let err = store.insert(5, 2, 2, b"second").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey));
        assert_eq!(&store.get(5).unwrap().unwrap().data[..], b"first");
    }

    fn test_insert_modes(store: Store) {
        store
            .insert_with(1, 0, 0, b"v1", InsertMode::Always)
            .unwrap();
        store
            .insert_with(1, 0, 0, b"v2", InsertMode::Always)
            .unwrap();
        assert_eq!(&store.get(1).unwrap().unwrap().data[..], b"v2");

        let err = store
            .insert_with(2, 0, 0, b"x", InsertMode::IfPresent)
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));

        store
            .insert_with(1, 0, 0, b"v3", InsertMode::IfPresent)
            .unwrap();
        assert_eq!(&store.get(1).unwrap().unwrap().data[..], b"v3");

        let err = store
            .insert_with(1, 0, 0, b"v4", InsertMode::IfAbsent)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey));
    }

    fn test_remove_and_reinsert(store: Store) {
        store.insert(3, 0, 0, b"here").unwrap();
        store.remove(3).unwrap();
        assert!(!store.exists(3).unwrap());
        // Removing an absent key succeeds
        store.remove(3).unwrap();
        store.remove(999).unwrap();
        store.insert(3, 0, 0, b"back").unwrap();
        assert_eq!(&store.get(3).unwrap().unwrap().data[..], b"back");
    }

    fn test_navigation(store: Store) {
        for key in [2u64, 5, 9] {
            store.insert(key, key, 0, b"k").unwrap();
        }
        assert_eq!(store.min_key().unwrap(), Some(2));
        assert_eq!(store.max_key().unwrap(), Some(9));

        assert_eq!(store.next_after(0).unwrap().unwrap().key, 2);
        assert_eq!(store.next_after(2).unwrap().unwrap().key, 5);
        assert!(store.next_after(9).unwrap().is_none());
        assert!(store.next_after(u64::MAX).unwrap().is_none());

        assert_eq!(store.prev_before(5).unwrap().unwrap().key, 2);
        assert!(store.prev_before(2).unwrap().is_none());
        assert!(store.prev_before(0).unwrap().is_none());
        // The MAX sentinel addresses the last entry
        assert_eq!(store.prev_before(u64::MAX).unwrap().unwrap().key, 9);

        let forward: Vec<u64> = store
            .range(3..=9, Direction::Forward)
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(forward, vec![5, 9]);

        let half_open: Vec<u64> = store
            .range(2..9, Direction::Forward)
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(half_open, vec![2, 5]);

        let reverse: Vec<u64> = store
            .range(.., Direction::Reverse)
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(reverse, vec![9, 5, 2]);
    }

    fn test_iteration_sorted_random(store: Store) {
        let mut rng = StdRng::seed_from_u64(0xFEED);
        let mut expected = BTreeSet::new();
        for _ in 0..200 {
            let key: u64 = rng.gen();
            if expected.insert(key) {
                store.insert(key, 0, 0, b"r").unwrap();
            }
        }

        let seen: Vec<u64> = store.iter().unwrap().map(|e| e.unwrap().key).collect();
        assert_eq!(seen.len() as u64, store.key_count().unwrap());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen, expected.iter().copied().collect::<Vec<_>>());
    }

    fn test_monotonic_queue(store: Store) {
        for i in 1..=100u64 {
            store
                .insert(i, 0, 0, format!("msg-{i}").as_bytes())
                .unwrap();
        }
        assert_eq!(store.min_key().unwrap(), Some(1));
        assert_eq!(store.max_key().unwrap(), Some(100));
        assert_eq!(store.key_count().unwrap(), 100);

        for i in [1u64, 50, 100] {
            let entry = store.take(i).unwrap().unwrap();
            assert_eq!(entry.data, format!("msg-{i}").as_bytes());
        }
        assert_eq!(store.key_count().unwrap(), 97);
    }

    fn test_compare_and_swap(store: Store) {
        store.insert(1, 0, 0, b"A").unwrap();
        assert_eq!(
            store.compare_and_swap(1, b"A", 1, 1, b"B").unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(
            store.compare_and_swap(1, b"A", 2, 2, b"C").unwrap(),
            CasOutcome::NoMatch
        );
        let entry = store.get(1).unwrap().unwrap();
        assert_eq!(&entry.data[..], b"B");
        assert_eq!(entry.term, 1);

        assert_eq!(
            store.compare_and_swap(2, b"A", 0, 0, b"X").unwrap(),
            CasOutcome::NotFound
        );
    }

    fn test_append_prepend(store: Store) {
        // Absent keys are created with the fragment as data
        assert_eq!(store.append(1, 0, 0, b"v1").unwrap(), 2);
        assert_eq!(store.append(1, 0, 0, b"v2").unwrap(), 4);
        assert_eq!(&store.get(1).unwrap().unwrap().data[..], b"v1v2");

        assert_eq!(store.prepend(2, 0, 0, b"tail").unwrap(), 4);
        assert_eq!(store.prepend(2, 0, 0, b"head-").unwrap(), 9);
        assert_eq!(&store.get(2).unwrap().unwrap().data[..], b"head-tail");
    }

    fn test_read_write_at(store: Store) {
        store.insert(1, 0, 0, b"hello world").unwrap();
        assert_eq!(&store.read_at(1, 6, 5).unwrap()[..], b"world");
        assert_eq!(&store.read_at(1, 6, 0).unwrap()[..], b"world");
        assert_eq!(&store.read_at(1, 0, 5).unwrap()[..], b"hello");
        assert!(store.read_at(1, 100, 5).unwrap().is_empty());
        assert!(matches!(
            store.read_at(2, 0, 0),
            Err(StoreError::NotFound)
        ));

        // Prefix + suffix reconstruct the whole value
        let mut joined = store.read_at(1, 0, 6).unwrap().to_vec();
        joined.extend_from_slice(&store.read_at(1, 6, 0).unwrap());
        assert_eq!(&joined[..], b"hello world");

        store.insert(2, 4, 5, b"abc").unwrap();
        assert_eq!(store.write_at(2, 1, b"ZZ").unwrap(), 3);
        assert_eq!(&store.get(2).unwrap().unwrap().data[..], b"aZZ");
        // Writing past the end zero-fills the gap
        assert_eq!(store.write_at(2, 5, b"xy").unwrap(), 7);
        let entry = store.get(2).unwrap().unwrap();
        assert_eq!(&entry.data[..], b"aZZ\x00\x00xy");
        assert_eq!(entry.term, 4);
        assert_eq!(entry.cmd, 5);

        assert!(matches!(
            store.write_at(3, 0, b"nope"),
            Err(StoreError::NotFound)
        ));
    }

    fn test_ttl_expiration(store: Store) {
        store.insert(42, 0, 0, b"ephemeral").unwrap();
        store.expire_after(42, 1).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(store.get(42).unwrap().is_none());
        assert!(!store.exists(42).unwrap());
        assert_eq!(store.expire_scan(0).unwrap(), 1);
        // Reaped for real: re-inserting the key succeeds
        store.insert(42, 0, 0, b"reborn").unwrap();
        assert_eq!(&store.get(42).unwrap().unwrap().data[..], b"reborn");
    }

    fn test_ttl_status(store: Store) {
        assert_eq!(store.ttl(1).unwrap(), TtlStatus::NotFound);
        assert_eq!(store.ttl(1).unwrap().as_millis(), -2);

        store.insert(1, 0, 0, b"forever").unwrap();
        assert_eq!(store.ttl(1).unwrap(), TtlStatus::NoExpiry);
        assert_eq!(store.ttl(1).unwrap().as_millis(), -1);

        store.expire_after(1, 100_000).unwrap();
        match store.ttl(1).unwrap() {
            TtlStatus::Remaining(ms) => assert!(ms > 0 && ms <= 100_000),
            other => panic!("unexpected ttl status {other:?}"),
        }

        store.persist(1).unwrap();
        assert_eq!(store.ttl(1).unwrap(), TtlStatus::NoExpiry);
        // Persisting a key without a TTL stays Ok
        store.persist(1).unwrap();

        assert!(matches!(store.persist(2), Err(StoreError::NotFound)));
        assert!(matches!(
            store.expire_after(2, 1000),
            Err(StoreError::NotFound)
        ));

        // Expired but unreaped reads as zero remaining
        store.insert(3, 0, 0, b"dying").unwrap();
        store.expire_after(3, 0).unwrap();
        assert_eq!(store.ttl(3).unwrap(), TtlStatus::Remaining(0));
    }

    fn test_expired_key_behaves_absent(store: Store) {
        store.insert(7, 1, 1, b"old").unwrap();
        store.expire_after(7, 0).unwrap();

        assert!(store.get(7).unwrap().is_none());
        assert!(!store.exists_with_term(7, 1).unwrap());
        assert_eq!(store.key_count().unwrap(), 0);
        assert_eq!(store.min_key().unwrap(), None);

        // Expired counts as absent: a strict insert succeeds and must not
        // inherit the stale deadline
        store.insert(7, 2, 2, b"new").unwrap();
        assert_eq!(&store.get(7).unwrap().unwrap().data[..], b"new");
        assert_eq!(store.ttl(7).unwrap(), TtlStatus::NoExpiry);
    }

    fn test_expire_scan_limits(store: Store) {
        for key in 1..=5u64 {
            store.insert(key, 0, 0, b"x").unwrap();
            store.expire_after(key, 0).unwrap();
        }
        store.insert(100, 0, 0, b"keeper").unwrap();

        assert_eq!(store.expire_scan(2).unwrap(), 2);
        assert_eq!(store.expire_scan(0).unwrap(), 3);
        assert_eq!(store.expire_scan(0).unwrap(), 0);
        assert_eq!(store.key_count().unwrap(), 1);
        assert!(store.exists(100).unwrap());
    }

    fn test_orphan_ttl_reaped(store: Store) {
        // A TTL record without its entry (imports and crashes can leave
        // these behind). The scan must tolerate and remove it.
        store
            .backend
            .apply(vec![WriteOp::Put {
                table: TTL_TABLE,
                key: 77,
                value: codec::encode_deadline(1),
            }])
            .unwrap();

        assert_eq!(store.ttl(77).unwrap(), TtlStatus::NotFound);
        assert_eq!(store.expire_scan(0).unwrap(), 1);
        assert_eq!(store.expire_scan(0).unwrap(), 0);
    }

    fn test_transactions(store: Store) {
        store.begin().unwrap();
        for key in 1..=100u64 {
            store.insert(key, 0, 0, b"staged").unwrap();
        }
        store.abort().unwrap();
        assert_eq!(store.key_count().unwrap(), 0);
        assert!(!store.exists(1).unwrap());

        store.begin().unwrap();
        // begin is idempotent while a batch is active
        store.begin().unwrap();
        for key in 1..=100u64 {
            store.insert(key, 0, 0, b"committed").unwrap();
        }
        store.commit().unwrap();
        assert_eq!(store.key_count().unwrap(), 100);
        assert!(store.exists(1).unwrap());

        // Without a batch, commit and abort are no-op successes
        store.commit().unwrap();
        store.abort().unwrap();
    }

    fn test_batch_overlay(store: Store) {
        store.insert(1, 0, 0, b"durable").unwrap();

        store.begin().unwrap();
        store.insert(2, 0, 0, b"staged").unwrap();
        store.remove(1).unwrap();

        // Reads see the union of the batch over the store, batch first
        assert!(store.exists(2).unwrap());
        assert!(!store.exists(1).unwrap());
        let keys: Vec<u64> = store.iter().unwrap().map(|e| e.unwrap().key).collect();
        assert_eq!(keys, vec![2]);
        assert_eq!(store.count_range(..).unwrap(), 1);
        assert_eq!(store.max_key().unwrap(), Some(2));

        // Batch writes to the same key supersede each other in issue order
        store
            .insert_with(2, 0, 0, b"staged-again", InsertMode::Always)
            .unwrap();
        assert_eq!(&store.get(2).unwrap().unwrap().data[..], b"staged-again");

        store.abort().unwrap();
        assert!(store.exists(1).unwrap());
        assert!(!store.exists(2).unwrap());
    }

    fn test_range_truncation(store: Store) {
        for key in 1..=10u64 {
            store.insert(key, 0, 0, b"n").unwrap();
        }
        assert_eq!(store.truncate_from(6).unwrap(), 5);
        assert_eq!(store.key_count().unwrap(), 5);
        assert_eq!(store.max_key().unwrap(), Some(5));
        assert!(!store.exists(6).unwrap());
        assert!(store.exists(5).unwrap());

        assert_eq!(store.truncate_through(2).unwrap(), 2);
        assert_eq!(store.min_key().unwrap(), Some(3));
        assert_eq!(store.key_count().unwrap(), 3);
    }

    fn test_remove_range(store: Store) {
        for key in 1..=10u64 {
            store.insert(key, 0, 0, b"n").unwrap();
        }
        assert_eq!(store.remove_range(3..=5).unwrap(), 3);
        assert_eq!(store.remove_range(20..=30).unwrap(), 0);
        assert_eq!(store.key_count().unwrap(), 7);
        assert_eq!(store.remove_range(..).unwrap(), 7);
        assert!(store.is_empty().unwrap());

        // Deleting a range also drops the TTL records inside it
        store.insert(4, 0, 0, b"ttl'd").unwrap();
        store.expire_after(4, 60_000).unwrap();
        store.remove_range(0..=10).unwrap();
        store.insert(4, 0, 0, b"fresh").unwrap();
        assert_eq!(store.ttl(4).unwrap(), TtlStatus::NoExpiry);
    }

    fn test_insert_batch(store: Store) {
        let entries: Vec<Entry> = (1..=5u64)
            .map(|key| Entry::new(key, key, 0, format!("e{key}").into_bytes()))
            .collect();

        assert_eq!(store.insert_batch(&entries).unwrap(), 5);
        // Every entry is a duplicate now, so the loop stops immediately
        assert_eq!(store.insert_batch(&entries).unwrap(), 0);

        store.clear().unwrap();
        store.insert(3, 0, 0, b"blocker").unwrap();
        // Stops at the first conflicting key, keeping what was inserted
        assert_eq!(store.insert_batch(&entries).unwrap(), 2);
        assert!(store.exists(2).unwrap());
        assert!(!store.exists(4).unwrap());

        store.clear().unwrap();
        let odd_only = store
            .insert_batch_filtered(&entries, |_, entry| entry.key % 2 == 1)
            .unwrap();
        assert_eq!(odd_only, 3);
        assert!(store.exists(5).unwrap());
        assert!(!store.exists(2).unwrap());

        // Under an active batch the whole group commits atomically with it
        store.clear().unwrap();
        store.begin().unwrap();
        assert_eq!(store.insert_batch(&entries).unwrap(), 5);
        store.abort().unwrap();
        assert_eq!(store.key_count().unwrap(), 0);
    }

    fn test_statistics(store: Store) {
        assert_eq!(store.key_count().unwrap(), 0);
        assert!(store.is_empty().unwrap());
        assert_eq!(store.min_key().unwrap(), None);
        assert_eq!(store.max_key().unwrap(), None);
        assert_eq!(store.data_size().unwrap(), 0);

        store.insert(10, 0, 0, b"12345").unwrap();
        store.insert(20, 0, 0, b"1234567890").unwrap();
        store.insert(30, 0, 0, b"").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.key_count, 3);
        assert_eq!(stats.min_key, Some(10));
        assert_eq!(stats.max_key, Some(30));
        assert_eq!(stats.data_size, 15);
        assert_eq!(store.data_size().unwrap(), 15);
    }

    fn test_count_range(store: Store) {
        for key in 1..=20u64 {
            store.insert(key, 0, 0, b"c").unwrap();
        }
        assert_eq!(store.count_range(5..=14).unwrap(), 10);
        assert_eq!(store.count_range(..).unwrap(), 20);
        assert_eq!(store.count_range(21..).unwrap(), 0);

        assert!(store.exists_in_range(1..=1).unwrap());
        assert!(store.exists_in_range(15..).unwrap());
        assert!(!store.exists_in_range(100..=200).unwrap());
    }

    fn test_replace_and_take(store: Store) {
        // Replacing a missing key creates it and reports no prior entry
        assert!(store.replace(1, 1, 1, b"first").unwrap().is_none());
        let old = store.replace(1, 2, 2, b"second").unwrap().unwrap();
        assert_eq!(&old.data[..], b"first");
        assert_eq!(old.term, 1);
        assert_eq!(&store.get(1).unwrap().unwrap().data[..], b"second");

        let taken = store.take(1).unwrap().unwrap();
        assert_eq!(&taken.data[..], b"second");
        assert!(store.take(1).unwrap().is_none());
        assert!(!store.exists(1).unwrap());
    }

    fn test_clear(store: Store) {
        store.insert(1, 0, 0, b"a").unwrap();
        store.insert(2, 0, 0, b"b").unwrap();
        store.expire_after(2, 60_000).unwrap();

        store.clear().unwrap();
        assert_eq!(store.key_count().unwrap(), 0);
        assert_eq!(store.ttl(2).unwrap(), TtlStatus::NotFound);
        store.insert(1, 0, 0, b"again").unwrap();
        assert!(store.exists(1).unwrap());
    }

    fn test_binary_dump_roundtrip(store: Store) {
        let dir = TempDir::new("kvidx-dump-test").expect("create dump dir");
        let dump = dir.path().join("dump.kvidx");

        store.insert(1, 10, 11, b"alpha").unwrap();
        store.insert(2, 20, 21, &[0x00, 0xFF, 0x7F]).unwrap();
        store.insert(3, 30, 31, b"").unwrap();

        store
            .export(&dump, &ExportOptions::default(), None)
            .unwrap();

        let restored = Store::new("", EngineType::InMemory).unwrap();
        restored
            .import(&dump, &ImportOptions::default(), None)
            .unwrap();

        for key in 1..=3u64 {
            assert_eq!(
                restored.get(key).unwrap().unwrap(),
                store.get(key).unwrap().unwrap()
            );
        }
    }

    #[cfg(feature = "redb")]
    #[test]
    fn test_reopen_preserves_committed_state_only() {
        let dir = TempDir::new("kvidx-reopen-test").unwrap();
        let path = dir.path().join("store");

        {
            let store = Store::new(&path, EngineType::Redb).unwrap();
            store.insert(1, 0, 0, b"durable").unwrap();
            store.begin().unwrap();
            store.insert(2, 0, 0, b"never committed").unwrap();
            // Dropped with the batch still open: equivalent to a crash
        }

        let store = Store::new(&path, EngineType::Redb).unwrap();
        assert!(store.exists(1).unwrap());
        assert!(!store.exists(2).unwrap());
    }

    #[cfg(feature = "redb")]
    #[test]
    fn test_schema_version_mismatch_is_rejected() {
        let dir = TempDir::new("kvidx-schema-test").unwrap();
        let path = dir.path().join("store");
        {
            let store = Store::new(&path, EngineType::Redb).unwrap();
            store.insert(1, 0, 0, b"x").unwrap();
        }

        let version_file = dir.path().join("store.version");
        assert!(version_file.exists());
        std::fs::write(&version_file, r#"{"schema_version": 99}"#).unwrap();
        assert!(matches!(
            Store::new(&path, EngineType::Redb),
            Err(StoreError::IncompatibleStoreVersion {
                found: 99,
                expected: STORE_SCHEMA_VERSION
            })
        ));

        std::fs::remove_file(&version_file).unwrap();
        assert!(matches!(
            Store::new(&path, EngineType::Redb),
            Err(StoreError::MissingStoreVersion { .. })
        ));
    }
}
