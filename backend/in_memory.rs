use crate::api::{Direction, RangeIter, StorageBackend, WriteOp, TABLES};
use crate::error::StoreError;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

type Table = BTreeMap<u64, Vec<u8>>;
type Database = HashMap<&'static str, Table>;

/// Non-persistent backend holding every table in an ordered map.
///
/// Serves as the reference implementation the on-disk adapters are checked
/// against.
#[derive(Debug)]
pub struct InMemoryBackend {
    inner: RwLock<Database>,
}

impl InMemoryBackend {
    pub fn open() -> Self {
        let mut db = Database::new();
        for table in TABLES {
            db.insert(table, Table::new());
        }
        Self {
            inner: RwLock::new(db),
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, table: &'static str, key: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.inner.read().map_err(|_| StoreError::LockError)?;
        Ok(db.get(table).and_then(|t| t.get(&key)).cloned())
    }

    fn range_iter(
        &self,
        table: &'static str,
        lo: u64,
        hi: u64,
        direction: Direction,
    ) -> Result<RangeIter<'_>, StoreError> {
        let db = self.inner.read().map_err(|_| StoreError::LockError)?;
        let rows: Vec<(u64, Vec<u8>)> = match db.get(table) {
            Some(t) => t.range(lo..=hi).map(|(k, v)| (*k, v.clone())).collect(),
            None => Vec::new(),
        };
        let iter = rows.into_iter().map(Ok);
        match direction {
            Direction::Forward => Ok(Box::new(iter)),
            Direction::Reverse => Ok(Box::new(iter.rev())),
        }
    }

    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut db = self.inner.write().map_err(|_| StoreError::LockError)?;
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    db.entry(table).or_default().insert(key, value);
                }
                WriteOp::Delete { table, key } => {
                    if let Some(t) = db.get_mut(table) {
                        t.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn clear(&self, table: &'static str) -> Result<(), StoreError> {
        let mut db = self.inner.write().map_err(|_| StoreError::LockError)?;
        if let Some(t) = db.get_mut(table) {
            t.clear();
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        // Nothing to persist for the in-memory backend
        Ok(())
    }
}
