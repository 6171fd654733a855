use crate::api::{Direction, RangeIter, StorageBackend, WriteOp, ENTRIES_TABLE, TTL_TABLE};
use crate::codec;
use crate::config::{StoreOptions, SyncMode};
use crate::error::StoreError;
use heed3::types::Bytes;
use heed3::{Database, DatabaseOpenOptions, EnvFlags, EnvOpenOptions, WithoutTls};
use std::ops::Bound;
use std::path::{Path, PathBuf};

// We don't use TLS so the env stays Send + Sync across handle owners
type Env = heed3::Env<WithoutTls>;

/// Default memory-map reservation when the caller does not size it.
const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024 * 1024; // 64 GiB

/// LMDB backend.
///
/// Each logical table is a named database inside one memory-mapped
/// environment; keys are stored 8-byte big-endian to keep LMDB's
/// lexicographic order aligned with numeric order.
#[derive(Debug)]
pub struct LmdbBackend {
    env: Env,
    entries: Database<Bytes, Bytes>,
    ttls: Database<Bytes, Bytes>,
    path: PathBuf,
}

impl LmdbBackend {
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let mut env_opts = EnvOpenOptions::new().read_txn_without_tls();
        env_opts.max_dbs(2);
        env_opts.map_size(options.mmap_size.map(|b| b as usize).unwrap_or(DEFAULT_MAP_SIZE));
        if options.sync_mode == SyncMode::Off {
            unsafe { env_opts.flags(EnvFlags::NO_SYNC) };
        }

        let env = unsafe { env_opts.open(&path)? };

        let mut wtxn = env.write_txn()?;
        let mut entries_opts = DatabaseOpenOptions::new(&env).types::<Bytes, Bytes>();
        entries_opts.name(ENTRIES_TABLE);
        let entries = entries_opts.create(&mut wtxn)?;
        let mut ttl_opts = DatabaseOpenOptions::new(&env).types::<Bytes, Bytes>();
        ttl_opts.name(TTL_TABLE);
        let ttls = ttl_opts.create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self {
            env,
            entries,
            ttls,
            path,
        })
    }

    fn database(&self, table: &'static str) -> Result<&Database<Bytes, Bytes>, StoreError> {
        match table {
            ENTRIES_TABLE => Ok(&self.entries),
            TTL_TABLE => Ok(&self.ttls),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown table {other}"
            ))),
        }
    }
}

impl StorageBackend for LmdbBackend {
    fn get(&self, table: &'static str, key: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.database(table)?;
        let rtxn = self.env.read_txn()?;
        Ok(db.get(&rtxn, &codec::encode_key(key))?.map(|v| v.to_vec()))
    }

    fn range_iter(
        &self,
        table: &'static str,
        lo: u64,
        hi: u64,
        direction: Direction,
    ) -> Result<RangeIter<'_>, StoreError> {
        let db = self.database(table)?;
        let lo_key = codec::encode_key(lo);
        let hi_key = codec::encode_key(hi);
        let bounds = (
            Bound::Included(lo_key.as_slice()),
            Bound::Included(hi_key.as_slice()),
        );

        // LMDB cursors borrow the read transaction, which cannot outlive this
        // call; materialize the range instead.
        let rtxn = self.env.read_txn()?;
        let mut rows = Vec::new();
        match direction {
            Direction::Forward => {
                for row in db.range(&rtxn, &bounds)? {
                    let (raw_key, value) = row?;
                    rows.push((decode_row_key(raw_key)?, value.to_vec()));
                }
            }
            Direction::Reverse => {
                for row in db.rev_range(&rtxn, &bounds)? {
                    let (raw_key, value) = row?;
                    rows.push((decode_row_key(raw_key)?, value.to_vec()));
                }
            }
        }
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    let db = self.database(table)?;
                    db.put(&mut wtxn, &codec::encode_key(key), &value)?;
                }
                WriteOp::Delete { table, key } => {
                    let db = self.database(table)?;
                    db.delete(&mut wtxn, &codec::encode_key(key))?;
                }
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    fn clear(&self, table: &'static str) -> Result<(), StoreError> {
        let db = self.database(table)?;
        let mut wtxn = self.env.write_txn()?;
        db.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.env.force_sync()?;
        Ok(())
    }

    fn file_size(&self) -> Result<Option<u64>, StoreError> {
        let data_file = self.path.join("data.mdb");
        match std::fs::metadata(data_file) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(_) => Ok(None),
        }
    }
}

fn decode_row_key(raw: &[u8]) -> Result<u64, StoreError> {
    codec::decode_key(raw).ok_or_else(|| StoreError::Internal("malformed key in database".into()))
}
