//! Coffer is a multi-tenant, distributed player-record persistence
//! engine. Each record is guarded by a lease in a shared LeaseMap and
//! mediated by a per-key session: updates buffer in memory and flush on
//! save, autosave, and unload; multi-key transactions commit atomically
//! through a write-ahead patch embedded in the record itself and a
//! single durable ledger bit.

mod config;
pub use config::{MigrationStep, StoreConfig};

mod fanout;
pub use fanout::ChangeEvent;

pub mod lock;
pub use lock::{LockHandle, LockManager};

mod migrate;
mod orphans;
mod queue;
mod session;
mod shard;

mod store;
pub use store::Store;

mod txn;

use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Hook validating a record's data at every durable boundary.
/// Returns `Err(reason)` to reject.
pub type SchemaFn = Arc<dyn Fn(&serde_json::Value) -> std::result::Result<(), String> + Send + Sync>;

/// Hook consulted exactly once when a key is first loaded and absent
/// from the DocStore: `Ok(Some(data))` seeds the record from a legacy
/// source, `Ok(None)` falls back to the configured template.
pub type ImportFn =
    Arc<dyn Fn(&str) -> anyhow::Result<Option<serde_json::Value>> + Send + Sync>;

/// Observer of committed mutations. Receives immutable before/after
/// snapshots; panics are isolated and logged.
pub type ObserverFn = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Error is the engine's failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key {0:?} is not loaded")]
    KeyNotLoaded(String),
    #[error("key {0:?} is already loaded")]
    KeyAlreadyLoaded(String),
    #[error("key {0:?} is not a valid record key")]
    InvalidKey(String),
    #[error("store is closed")]
    StoreClosed,
    #[error("lock for key {0:?} was lost")]
    LockLost(String),
    #[error("lock for key {0:?} is held by another process")]
    LockUnavailable(String),
    #[error("schema rejected data for key {key:?}: {reason}")]
    SchemaFailed { key: String, reason: String },
    #[error("update transform for key {0:?} panicked")]
    UpdatePanicked(String),
    #[error("transaction transform changed its participating key set")]
    KeysChangedInTransaction,
    #[error("record for key {key:?} is corrupt: {detail}")]
    CorruptRecord { key: String, detail: String },
    #[error("record for key {key:?} applied migration {name:?} unknown to this store")]
    UnknownMigration { key: String, name: String },
    #[error("migration {name:?} failed for key {key:?}")]
    MigrationFailed {
        key: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("legacy import failed for key {key:?}")]
    ImportFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Backend(#[from] backend::Error),
}

impl From<codec::Error> for Error {
    fn from(err: codec::Error) -> Self {
        Error::CorruptRecord {
            key: String::new(),
            detail: err.to_string(),
        }
    }
}

impl Error {
    pub(crate) fn corrupt(key: &str, err: impl std::fmt::Display) -> Self {
        Error::CorruptRecord {
            key: key.to_string(),
            detail: err.to_string(),
        }
    }
}
