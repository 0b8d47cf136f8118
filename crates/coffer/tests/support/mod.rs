//! Shared fixtures for the end-to-end suites: in-memory platform
//! services and a small player-coins store.

use backend::{MemoryDocStore, MemoryLeaseMap};
use coffer::{Store, StoreConfig};
use serde_json::json;
use std::sync::Arc;

/// The two platform services backing a store. Clones share state, so
/// several `Store` instances over one `Services` behave like separate
/// processes against the same backend.
pub struct Services {
    pub docs: MemoryDocStore,
    pub leases: MemoryLeaseMap,
}

impl Services {
    pub fn new() -> Self {
        init_tracing();
        Self {
            docs: MemoryDocStore::new(),
            leases: MemoryLeaseMap::new(),
        }
    }
}

/// Route engine logs through the test harness, honoring RUST_LOG.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A `players` store whose records hold a numeric coin balance.
pub fn coins_config() -> StoreConfig {
    StoreConfig::new("players", json!({"coins": 0})).with_schema(|data| {
        match data.get("coins") {
            Some(coins) if coins.is_number() => Ok(()),
            _ => Err("coins must be a number".to_string()),
        }
    })
}

pub async fn open_store(services: &Services, config: StoreConfig) -> Store {
    Store::open(
        config,
        Arc::new(services.docs.clone()),
        Arc::new(services.leases.clone()),
    )
    .await
    .expect("store opens")
}
