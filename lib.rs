mod codec;
mod export;
mod iter;
mod store;

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod registry;

pub use api::Direction;
pub use config::{JournalMode, StoreOptions, SyncMode};
pub use error::StoreError;
pub use export::{ExportFormat, ExportOptions, ImportOptions, ProgressFn};
pub use iter::EntryIter;
pub use registry::{adapter_by_index, adapter_by_name, adapter_count, AdapterInfo, EngineType};
pub use store::{
    CasOutcome, Entry, InsertMode, Store, StoreStats, TtlStatus, MAX_DATA_LEN,
    STORE_SCHEMA_VERSION,
};
