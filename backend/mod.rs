//! This module contains the implementations of the
//! [`StorageBackend`](crate::api::StorageBackend) trait for our different
//! engines.

/// In memory backend - most useful for testing
pub mod in_memory;
/// LMDB (memory-mapped) backend
#[cfg(feature = "mmap")]
pub mod lmdb;
/// redb (B-tree) backend
#[cfg(feature = "redb")]
pub mod redb;
/// RocksDB (LSM) backend
#[cfg(feature = "rocksdb")]
pub mod rocksdb;
