use crate::api::{ApproxStats, Direction, RangeIter, StorageBackend, WriteOp, TABLES};
use crate::codec;
use crate::config::{JournalMode, StoreOptions, SyncMode};
use crate::error::StoreError;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode,
    MultiThreaded, Options, ReadOptions, WriteBatch, WriteOptions,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

type Db = DBWithThreadMode<MultiThreaded>;

/// RocksDB backend.
///
/// Each logical table is a column family; keys are stored 8-byte big-endian
/// so SST ordering matches numeric key order. Atomic writes go through a
/// single `WriteBatch`, which spans column families.
#[derive(Debug)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
    /// Fsync every write (sync-mode full).
    sync_writes: bool,
    /// Skip the WAL entirely (journal-mode off/memory).
    disable_wal: bool,
}

impl RocksDbBackend {
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(-1);
        opts.set_max_background_jobs(4);
        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_compression_type(rocksdb::DBCompressionType::None);
        opts.set_use_fsync(false); // fdatasync

        let block_cache = options.cache_size.map(|bytes| {
            info!(bytes, "rocksdb block cache configured");
            Cache::new_lru_cache(bytes as usize)
        });

        // Open all column families, including leftovers from older schemas
        let existing_cfs =
            Db::list_cf(&opts, path.as_ref()).unwrap_or_else(|_| vec!["default".to_string()]);
        let mut all_cfs_to_open: HashSet<String> = existing_cfs.iter().cloned().collect();
        all_cfs_to_open.extend(TABLES.iter().map(|table| table.to_string()));

        let mut cf_descriptors = Vec::new();
        for cf_name in &all_cfs_to_open {
            let mut cf_opts = Options::default();
            cf_opts.set_compression_type(rocksdb::DBCompressionType::None);
            cf_opts.set_write_buffer_size(64 * 1024 * 1024); // 64MB

            let mut block_opts = BlockBasedOptions::default();
            block_opts.set_block_size(16 * 1024); // 16KB
            block_opts.set_bloom_filter(10.0, false);
            if let Some(cache) = block_cache.as_ref() {
                block_opts.set_block_cache(cache);
            }
            cf_opts.set_block_based_table_factory(&block_opts);

            cf_descriptors.push(ColumnFamilyDescriptor::new(cf_name, cf_opts));
        }

        let db = Db::open_cf_descriptors(&opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Internal(format!("failed to open rocksdb: {e}")))?;

        // Clean up obsolete column families
        for cf_name in &existing_cfs {
            if cf_name != "default" && !TABLES.contains(&cf_name.as_str()) {
                warn!("dropping obsolete column family: {cf_name}");
                let _ = db
                    .drop_cf(cf_name)
                    .inspect_err(|e| warn!("failed to drop column family '{cf_name}': {e}"));
            }
        }

        Ok(Self {
            db: Arc::new(db),
            path: path.as_ref().to_path_buf(),
            sync_writes: options.sync_mode == SyncMode::Full,
            disable_wal: matches!(options.journal_mode, JournalMode::Off | JournalMode::Memory),
        })
    }

    fn cf(
        &self,
        table: &'static str,
    ) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(table)
            .ok_or_else(|| StoreError::Internal(format!("column family {table} not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut wo = WriteOptions::default();
        wo.set_sync(self.sync_writes);
        wo.disable_wal(self.disable_wal);
        wo
    }
}

impl Drop for RocksDbBackend {
    fn drop(&mut self) {
        // When the last reference to the db is dropped, stop background threads
        // See https://github.com/facebook/rocksdb/issues/11349
        if let Some(db) = Arc::get_mut(&mut self.db) {
            db.cancel_all_background_work(true);
        }
    }
}

/// Smallest byte string strictly greater than every encoded key ≤ `hi`.
fn exclusive_upper_bound(hi: u64) -> Vec<u8> {
    match hi.checked_add(1) {
        Some(next) => codec::encode_key(next).to_vec(),
        None => {
            // One byte past the 8-byte all-FF key
            let mut bound = codec::encode_key(u64::MAX).to_vec();
            bound.push(0x00);
            bound
        }
    }
}

impl StorageBackend for RocksDbBackend {
    fn get(&self, table: &'static str, key: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(table)?;
        Ok(self.db.get_cf(&cf, codec::encode_key(key))?)
    }

    fn range_iter(
        &self,
        table: &'static str,
        lo: u64,
        hi: u64,
        direction: Direction,
    ) -> Result<RangeIter<'_>, StoreError> {
        let cf = self.cf(table)?;
        let mut ro = ReadOptions::default();
        ro.set_iterate_lower_bound(codec::encode_key(lo).to_vec());
        ro.set_iterate_upper_bound(exclusive_upper_bound(hi));
        let mode = match direction {
            Direction::Forward => IteratorMode::Start,
            Direction::Reverse => IteratorMode::End,
        };
        let iter = self.db.iterator_cf_opt(&cf, ro, mode).map(|row| {
            let (raw_key, value) = row?;
            let key = codec::decode_key(&raw_key)
                .ok_or_else(|| StoreError::Internal("malformed key in column family".into()))?;
            Ok((key, value.into_vec()))
        });
        Ok(Box::new(iter))
    }

    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    batch.put_cf(&self.cf(table)?, codec::encode_key(key), value);
                }
                WriteOp::Delete { table, key } => {
                    batch.delete_cf(&self.cf(table)?, codec::encode_key(key));
                }
            }
        }
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(|e| StoreError::Internal(format!("failed to commit batch: {e}")))
    }

    fn clear(&self, table: &'static str) -> Result<(), StoreError> {
        let cf = self.cf(table)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        let mut batch = WriteBatch::default();
        while let Some(Ok((key, _))) = iter.next() {
            batch.delete_cf(&cf, key);
        }
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(|e| StoreError::Internal(format!("rocksdb batch write error: {e}")))
    }

    fn sync(&self) -> Result<(), StoreError> {
        if self.disable_wal {
            // No WAL to sync; push memtables to SSTs instead
            self.db
                .flush()
                .map_err(|e| StoreError::Internal(format!("rocksdb flush error: {e}")))
        } else {
            self.db
                .flush_wal(true)
                .map_err(|e| StoreError::Internal(format!("rocksdb wal sync error: {e}")))
        }
    }

    fn approx_stats(&self) -> Result<Option<ApproxStats>, StoreError> {
        let cf = self.cf(crate::api::ENTRIES_TABLE)?;
        let key_count = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        let live_data_bytes = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-live-data-size")?
            .unwrap_or(0);
        Ok(Some(ApproxStats {
            live_data_bytes,
            key_count,
        }))
    }

    fn approx_range_bytes(&self, lo: u64, hi: u64) -> Result<Option<u64>, StoreError> {
        let range_lo = codec::encode_key(lo).to_vec();
        let range_hi = exclusive_upper_bound(hi);
        let mut bytes = 0u64;
        for file in self.db.live_files()? {
            if file.column_family_name != crate::api::ENTRIES_TABLE {
                continue;
            }
            // Count any SST whose key span intersects [lo, hi]
            let starts_after_range = file
                .start_key
                .as_deref()
                .is_some_and(|start| start >= range_hi.as_slice());
            let ends_before_range = file
                .end_key
                .as_deref()
                .is_some_and(|end| end < range_lo.as_slice());
            if !starts_after_range && !ends_before_range {
                bytes = bytes.saturating_add(file.size as u64);
            }
        }
        Ok(Some(bytes))
    }

    fn file_size(&self) -> Result<Option<u64>, StoreError> {
        let mut total = 0u64;
        for dir_entry in std::fs::read_dir(&self.path)? {
            let metadata = dir_entry?.metadata()?;
            if metadata.is_file() {
                total = total.saturating_add(metadata.len());
            }
        }
        Ok(Some(total))
    }
}
