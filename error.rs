use thiserror::Error;

/// Errors surfaced by the store and its backends.
///
/// The first three variants are predicate failures: they are expected
/// outcomes the caller branches on and carry no diagnostic text. Everything
/// else preserves the originating message.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("condition failed")]
    ConditionFailed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "rocksdb")]
    #[error("rocksdb error: {0}")]
    Rocksdb(#[from] rocksdb::Error),
    #[error("{0}")]
    Internal(String),
    #[error("failed to lock store state")]
    LockError,
    #[error("store version file missing (expected schema version {expected})")]
    MissingStoreVersion { expected: u32 },
    #[error("incompatible store schema version: found {found}, expected {expected}")]
    IncompatibleStoreVersion { found: u32, expected: u32 },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Internal(format!("json error: {err}"))
    }
}

#[cfg(feature = "redb")]
mod redb_conversions {
    use super::StoreError;

    impl From<redb::DatabaseError> for StoreError {
        fn from(err: redb::DatabaseError) -> Self {
            StoreError::Internal(format!("redb error: {err}"))
        }
    }

    impl From<redb::TransactionError> for StoreError {
        fn from(err: redb::TransactionError) -> Self {
            StoreError::Internal(format!("redb error: {err}"))
        }
    }

    impl From<redb::TableError> for StoreError {
        fn from(err: redb::TableError) -> Self {
            StoreError::Internal(format!("redb error: {err}"))
        }
    }

    impl From<redb::StorageError> for StoreError {
        fn from(err: redb::StorageError) -> Self {
            StoreError::Internal(format!("redb error: {err}"))
        }
    }

    impl From<redb::CommitError> for StoreError {
        fn from(err: redb::CommitError) -> Self {
            StoreError::Internal(format!("redb error: {err}"))
        }
    }
}

#[cfg(feature = "mmap")]
impl From<heed3::Error> for StoreError {
    fn from(err: heed3::Error) -> Self {
        StoreError::Internal(format!("lmdb error: {err}"))
    }
}
