use serde::{Deserialize, Serialize};

/// Journaling behavior requested from the engine.
///
/// Backends map each value to their closest native equivalent and silently
/// accept values they have no counterpart for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    #[default]
    Wal,
    Memory,
    Off,
}

/// How aggressively committed state is pushed to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// No fsync on commit.
    Off,
    /// Fsync at commit barriers.
    #[default]
    Normal,
    /// Fsync after every write.
    Full,
}

/// Open-time tuning knobs.
///
/// Every backend reads the subset it understands; the rest is accepted and
/// ignored so one configuration can be shared across engines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub journal_mode: JournalMode,
    pub sync_mode: SyncMode,
    /// Memory-map reservation for mmap-based engines, in bytes.
    pub mmap_size: Option<u64>,
    /// Block / page cache size hint, in bytes.
    pub cache_size: Option<u64>,
}
