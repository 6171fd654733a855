use crate::api::{Direction, RangeIter, StorageBackend, WriteOp, ENTRIES_TABLE, TTL_TABLE};
use crate::config::{StoreOptions, SyncMode};
use crate::error::StoreError;
use redb::{Database, Durability, TableDefinition};
use std::path::{Path, PathBuf};

const ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("entries");
const TTLS: TableDefinition<u64, &[u8]> = TableDefinition::new("ttl");

/// redb backend.
///
/// A single copy-on-write B-tree file with one table per logical table.
/// Keys use redb's native `u64` type, so no byte encoding is needed.
#[derive(Debug)]
pub struct RedbBackend {
    db: Database,
    path: PathBuf,
    durability: Durability,
}

fn definition(table: &'static str) -> Result<TableDefinition<'static, u64, &'static [u8]>, StoreError> {
    match table {
        ENTRIES_TABLE => Ok(ENTRIES),
        TTL_TABLE => Ok(TTLS),
        other => Err(StoreError::InvalidArgument(format!(
            "unknown table {other}"
        ))),
    }
}

impl RedbBackend {
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut builder = Database::builder();
        if let Some(cache) = options.cache_size {
            builder.set_cache_size(cache as usize);
        }
        let db = builder.create(&path)?;

        // Create both tables up front so read transactions never race table
        // creation.
        let init_txn = db.begin_write()?;
        init_txn.open_table(ENTRIES)?;
        init_txn.open_table(TTLS)?;
        init_txn.commit()?;

        let durability = match options.sync_mode {
            SyncMode::Off => Durability::None,
            SyncMode::Normal => Durability::Eventual,
            SyncMode::Full => Durability::Immediate,
        };

        Ok(Self {
            db,
            path,
            durability,
        })
    }
}

impl StorageBackend for RedbBackend {
    fn get(&self, table: &'static str, key: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(definition(table)?)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    fn range_iter(
        &self,
        table: &'static str,
        lo: u64,
        hi: u64,
        direction: Direction,
    ) -> Result<RangeIter<'_>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(definition(table)?)?;

        // The cursor must not outlive the read transaction, which ends with
        // this call; materialize the range instead.
        let mut rows = Vec::new();
        for row in table.range(lo..=hi)? {
            let (key, value) = row?;
            rows.push((key.value(), value.value().to_vec()));
        }
        if direction == Direction::Reverse {
            rows.reverse();
        }
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(self.durability);
        {
            let mut entries = write_txn.open_table(ENTRIES)?;
            let mut ttls = write_txn.open_table(TTLS)?;
            for op in &ops {
                match op {
                    WriteOp::Put { table, key, value } => {
                        let target = if *table == TTL_TABLE {
                            &mut ttls
                        } else {
                            &mut entries
                        };
                        target.insert(key, value.as_slice())?;
                    }
                    WriteOp::Delete { table, key } => {
                        let target = if *table == TTL_TABLE {
                            &mut ttls
                        } else {
                            &mut entries
                        };
                        target.remove(key)?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn clear(&self, table: &'static str) -> Result<(), StoreError> {
        let def = definition(table)?;
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(self.durability);
        write_txn.delete_table(def)?;
        write_txn.open_table(def)?;
        write_txn.commit()?;
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        // An empty immediately-durable commit fences all earlier eventual
        // commits onto disk.
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(Durability::Immediate);
        write_txn.commit()?;
        Ok(())
    }

    fn file_size(&self) -> Result<Option<u64>, StoreError> {
        Ok(Some(std::fs::metadata(&self.path)?.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn open_backend(dir: &TempDir) -> RedbBackend {
        RedbBackend::open(dir.path().join("store.db"), &StoreOptions::default()).unwrap()
    }

    #[test]
    fn test_basic_operations() {
        let dir = TempDir::new("kvidx-redb-test").unwrap();
        let backend = open_backend(&dir);

        backend
            .apply(vec![
                WriteOp::Put {
                    table: ENTRIES_TABLE,
                    key: 1,
                    value: b"one".to_vec(),
                },
                WriteOp::Put {
                    table: TTL_TABLE,
                    key: 1,
                    value: b"deadline".to_vec(),
                },
            ])
            .unwrap();

        assert_eq!(backend.get(ENTRIES_TABLE, 1).unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.get(TTL_TABLE, 1).unwrap(), Some(b"deadline".to_vec()));
        assert_eq!(backend.get(ENTRIES_TABLE, 2).unwrap(), None);
    }

    #[test]
    fn test_range_reverse() {
        let dir = TempDir::new("kvidx-redb-test").unwrap();
        let backend = open_backend(&dir);
        backend
            .apply(
                (1u64..=4)
                    .map(|k| WriteOp::Put {
                        table: ENTRIES_TABLE,
                        key: k,
                        value: vec![k as u8],
                    })
                    .collect(),
            )
            .unwrap();

        let keys: Vec<u64> = backend
            .range_iter(ENTRIES_TABLE, 1, 3, Direction::Reverse)
            .unwrap()
            .map(|row| row.unwrap().0)
            .collect();
        assert_eq!(keys, vec![3, 2, 1]);
    }

    #[test]
    fn test_clear_only_touches_one_table() {
        let dir = TempDir::new("kvidx-redb-test").unwrap();
        let backend = open_backend(&dir);
        backend
            .apply(vec![
                WriteOp::Put {
                    table: ENTRIES_TABLE,
                    key: 9,
                    value: b"keep".to_vec(),
                },
                WriteOp::Put {
                    table: TTL_TABLE,
                    key: 9,
                    value: b"drop".to_vec(),
                },
            ])
            .unwrap();

        backend.clear(TTL_TABLE).unwrap();
        assert_eq!(backend.get(TTL_TABLE, 9).unwrap(), None);
        assert_eq!(backend.get(ENTRIES_TABLE, 9).unwrap(), Some(b"keep".to_vec()));
    }
}
