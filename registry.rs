//! Compile-time adapter registry.
//!
//! Enumerates every backend compiled into this build and the path
//! conventions it uses. The registry is immutable after first use; there is
//! no other global state in the crate.

use std::sync::OnceLock;

/// Storage backend type selection.
///
/// Used when creating a new [`Store`](crate::Store) to specify which engine
/// to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    /// In-memory storage, non-persistent. Suitable for testing.
    InMemory,
    /// RocksDB storage (LSM), persistent. Suitable for production.
    #[cfg(feature = "rocksdb")]
    RocksDB,
    /// redb storage (copy-on-write B-tree), persistent, single file.
    #[cfg(feature = "redb")]
    Redb,
    /// LMDB storage (memory-mapped B-tree), persistent.
    #[cfg(feature = "mmap")]
    Lmdb,
}

/// One registered backend: its public name, engine selector, and the suffix
/// appended to the caller's path (single-file engines get an extension,
/// directory-based engines none).
#[derive(Debug, Clone, Copy)]
pub struct AdapterInfo {
    pub name: &'static str,
    pub engine: EngineType,
    pub path_suffix: &'static str,
}

static ADAPTERS: OnceLock<Vec<AdapterInfo>> = OnceLock::new();

/// All backends compiled into this build, in registration order.
pub fn adapters() -> &'static [AdapterInfo] {
    ADAPTERS.get_or_init(|| {
        let mut list = vec![AdapterInfo {
            name: "memory",
            engine: EngineType::InMemory,
            path_suffix: "",
        }];
        #[cfg(feature = "rocksdb")]
        list.push(AdapterInfo {
            name: "rocksdb",
            engine: EngineType::RocksDB,
            path_suffix: "",
        });
        #[cfg(feature = "redb")]
        list.push(AdapterInfo {
            name: "redb",
            engine: EngineType::Redb,
            path_suffix: ".db",
        });
        #[cfg(feature = "mmap")]
        list.push(AdapterInfo {
            name: "lmdb",
            engine: EngineType::Lmdb,
            path_suffix: "",
        });
        list
    })
}

/// Number of backends compiled in.
pub fn adapter_count() -> usize {
    adapters().len()
}

/// Looks a backend up by registration index.
pub fn adapter_by_index(index: usize) -> Option<&'static AdapterInfo> {
    adapters().get(index)
}

/// Looks a backend up by its public name.
pub fn adapter_by_name(name: &str) -> Option<&'static AdapterInfo> {
    adapters().iter().find(|info| info.name == name)
}

impl EngineType {
    /// Registry entry for this engine.
    pub fn info(self) -> &'static AdapterInfo {
        // Every variant is pushed in adapters() under the same cfg that
        // guards the variant itself.
        adapters()
            .iter()
            .find(|info| info.engine == self)
            .unwrap_or(&adapters()[0])
    }
}
