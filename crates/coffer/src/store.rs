//! The store facade: owns the key-to-session map, the store-wide
//! lifecycle, and the background orphan sweep.

use crate::fanout::{ChangeEvent, Fanout};
use crate::lock::LockManager;
use crate::orphans::OrphanQueue;
use crate::queue::Op;
use crate::session::{self, Phase, RecordState, Session, Shared};
use crate::{migrate, shard, txn, Error, Result, StoreConfig};
use backend::{DocStore, LeaseMap, RetryPolicy};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Shared plumbing handed to every subsystem of one store.
pub(crate) struct Core {
    pub config: StoreConfig,
    pub docs: Arc<dyn DocStore>,
    pub policy: RetryPolicy,
    pub locks: LockManager,
    pub fanout: Fanout,
    pub orphans: OrphanQueue,
    pub cancel: CancellationToken,
    closed: AtomicBool,
}

impl Core {
    fn new(config: StoreConfig, docs: Arc<dyn DocStore>, leases: Arc<dyn LeaseMap>) -> Self {
        let policy = RetryPolicy::default();
        let fanout = Fanout::new(config.observers.clone());
        let orphans = OrphanQueue::new(docs.clone(), config.orphan_queue_id(), policy.clone());
        Self {
            locks: LockManager::new(leases, policy.clone()),
            config,
            docs,
            policy,
            fanout,
            orphans,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn for_tests(config: StoreConfig) -> (Self, backend::MemoryDocStore) {
        let docs = backend::MemoryDocStore::new();
        let core = Self::new(
            config,
            Arc::new(docs.clone()),
            Arc::new(backend::MemoryLeaseMap::new()),
        );
        (core, docs)
    }
}

enum Entry {
    /// A load is in flight; the key rejects everything else meanwhile.
    Loading,
    Live(Session),
}

struct Inner {
    core: Arc<Core>,
    sessions: std::sync::Mutex<HashMap<String, Entry>>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Store is the host-facing facade over one namespace of records.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Validate the configuration, sweep the orphan queue once, start
    /// the periodic sweep, and expose the store.
    pub async fn open(
        config: StoreConfig,
        docs: Arc<dyn DocStore>,
        leases: Arc<dyn LeaseMap>,
    ) -> Result<Store> {
        config.validate()?;
        let core = Arc::new(Core::new(config, docs, leases));

        if let Err(err) = core.orphans.sweep(&core.cancel).await {
            tracing::warn!(store = %core.config.name, ?err, "opening orphan sweep failed");
        }

        let sweeper = tokio::spawn(sweep_loop(core.clone()));
        tracing::info!(store = %core.config.name, "store opened");

        Ok(Store {
            inner: Arc::new(Inner {
                core,
                sessions: std::sync::Mutex::new(HashMap::new()),
                sweeper: std::sync::Mutex::new(Some(sweeper)),
            }),
        })
    }

    fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    fn check_open(&self) -> Result<()> {
        if self.core().is_closed() {
            Err(Error::StoreClosed)
        } else {
            Ok(())
        }
    }

    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() || key.contains('/') {
            return Err(Error::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn live_session(&self, key: &str) -> Result<Arc<Shared>> {
        let sessions = self.inner.sessions.lock().unwrap();
        match sessions.get(key) {
            Some(Entry::Live(session)) => Ok(session.shared.clone()),
            Some(Entry::Loading) | None => Err(Error::KeyNotLoaded(key.to_string())),
        }
    }

    /// Load `key`: acquire its lease, read and reassemble the record,
    /// resolve any staged transaction, migrate, validate, and spawn the
    /// session. Resolves once the key is Ready.
    pub async fn load(&self, key: &str) -> Result<()> {
        self.check_open()?;
        Self::check_key(key)?;

        {
            let mut sessions = self.inner.sessions.lock().unwrap();
            if sessions.contains_key(key) {
                return Err(Error::KeyAlreadyLoaded(key.to_string()));
            }
            sessions.insert(key.to_string(), Entry::Loading);
        }

        let result = self.load_inner(key).await;
        match result {
            Ok((session, initial)) => {
                if self.core().is_closed() {
                    // close() drained the map while we were loading.
                    let _ = unload_session(&session).await;
                    self.inner.sessions.lock().unwrap().remove(key);
                    return Err(Error::StoreClosed);
                }
                // Queue the initial event before the session becomes
                // reachable, so no update can outrun it.
                self.core().fanout.send(ChangeEvent {
                    key: key.to_string(),
                    new: initial,
                    old: None,
                });
                self.inner
                    .sessions
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), Entry::Live(session));
                tracing::info!(key, "session ready");
                Ok(())
            }
            Err(err) => {
                self.inner.sessions.lock().unwrap().remove(key);
                tracing::warn!(key, %err, "load failed");
                Err(err)
            }
        }
    }

    async fn load_inner(&self, key: &str) -> Result<(Session, Arc<Value>)> {
        let core = self.core().clone();
        let config = &core.config;

        let lock = core
            .locks
            .acquire(
                &config.lease_key(key),
                config.lock_duration,
                config.refresh_interval(),
                &core.cancel,
            )
            .await
            .map_err(|err| match err {
                Error::LockUnavailable(_) => Error::LockUnavailable(key.to_string()),
                err => err,
            })?;

        let record = match self.read_and_resolve(key, &core.cancel).await {
            Ok(record) => record,
            Err(err) => {
                lock.release().await;
                return Err(err);
            }
        };

        if core.is_closed() {
            lock.release().await;
            return Err(Error::StoreClosed);
        }
        let initial = record.data.clone();
        Ok((Session::spawn(key.to_string(), core, lock, record), initial))
    }

    async fn read_and_resolve(&self, key: &str, cancel: &CancellationToken) -> Result<RecordState> {
        let core = self.core();
        let config = &core.config;

        let Some(loaded) = shard::read_record(core, key, cancel).await? else {
            // First sight of this key: consult the legacy importer, then
            // fall back to the template. Fresh data is born fully
            // migrated.
            let imported = match &config.import_legacy {
                None => None,
                Some(import) => {
                    let result =
                        std::panic::catch_unwind(AssertUnwindSafe(|| import(key))).map_err(
                            |_panic| Error::ImportFailed {
                                key: key.to_string(),
                                source: anyhow::anyhow!("import hook panicked"),
                            },
                        )?;
                    result.map_err(|source| Error::ImportFailed {
                        key: key.to_string(),
                        source,
                    })?
                }
            };
            let data = match imported {
                Some(data) => {
                    tracing::info!(key, "seeded record from legacy import");
                    data
                }
                None => config.template.clone(),
            };
            let applied = config
                .migrations
                .iter()
                .map(|step| step.name.clone())
                .collect();
            let record = RecordState::fresh(data, applied);
            self.validate(key, &record.data)?;
            return Ok(record);
        };

        let resolved = txn::resolve_read(core, key, &loaded, cancel).await?;
        let outcome = migrate::run(
            key,
            resolved.data,
            &loaded.meta.applied_migrations,
            &config.migrations,
        )?;
        self.validate(key, &outcome.data)?;

        Ok(RecordState {
            data: Arc::new(outcome.data),
            version: Some(loaded.version),
            shard_ids: loaded.meta.shard_ids,
            applied_migrations: outcome.applied,
            staged_tx: None,
            heal_ledger: resolved.heal_ledger,
            dirty: outcome.changed || resolved.needs_collapse,
        })
    }

    fn validate(&self, key: &str, data: &Value) -> Result<()> {
        let Some(schema) = &self.core().config.schema else {
            return Ok(());
        };
        schema(data).map_err(|reason| Error::SchemaFailed {
            key: key.to_string(),
            reason,
        })
    }

    /// Apply a synchronous transform to the key's data. Returns the
    /// transform's verdict: true committed, false aborted.
    pub async fn update(
        &self,
        key: &str,
        transform: impl FnOnce(&mut Value) -> bool + Send + 'static,
    ) -> Result<bool> {
        self.check_open()?;
        let shared = self.live_session(key)?;

        if shared.fast_path_allowed() {
            return session::do_update(&shared, Box::new(transform), true).await;
        }

        let (reply, rx) = oneshot::channel();
        shared.enqueue(Op::Update {
            transform: Box::new(transform),
            reply,
        })?;
        rx.await.unwrap_or_else(|_| Err(shared.reject_error()))
    }

    /// Atomically transform several keys. All keys must be loaded and
    /// Ready in this store. The transform sees deep copies keyed by key
    /// and must neither add nor remove entries; returning false aborts
    /// the whole transaction.
    pub async fn tx(
        &self,
        keys: &[&str],
        transform: impl FnOnce(&mut BTreeMap<String, Value>) -> bool + Send + 'static,
    ) -> Result<bool> {
        self.check_open()?;

        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut participants = Vec::with_capacity(sorted.len());
        for key in sorted {
            participants.push((key.to_string(), self.live_session(key)?));
        }
        txn::run_tx(self.core(), participants, Box::new(transform)).await
    }

    /// Force a durable flush of the key's pending changes.
    pub async fn save(&self, key: &str) -> Result<()> {
        self.check_open()?;
        let shared = self.live_session(key)?;
        let (reply, rx) = oneshot::channel();
        shared.enqueue(Op::Save { reply })?;
        rx.await.unwrap_or_else(|_| Err(shared.reject_error()))
    }

    /// A deep copy of the key's current data.
    pub async fn get(&self, key: &str) -> Result<Value> {
        self.check_open()?;
        let shared = self.live_session(key)?;
        if shared.phase() != Phase::Ready {
            return Err(shared.reject_error());
        }
        let record = shared.record.lock().await;
        Ok((*record.data).clone())
    }

    /// Lockless point-in-time read of a record, without creating a
    /// session. Applies the read-tx rule; never migrates, never writes.
    pub async fn peek(&self, key: &str) -> Result<Option<Value>> {
        self.check_open()?;
        Self::check_key(key)?;
        let core = self.core();

        let Some(loaded) = shard::read_record(core, key, &core.cancel).await? else {
            return Ok(None);
        };
        let resolved = txn::resolve_read(core, key, &loaded, &core.cancel).await?;
        Ok(Some(resolved.data))
    }

    /// Flush and tear down the key's session, releasing its lease.
    pub async fn unload(&self, key: &str) -> Result<()> {
        let session = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            match sessions.remove(key) {
                Some(Entry::Live(session)) => session,
                Some(Entry::Loading) => {
                    // The in-flight load still owns this entry.
                    sessions.insert(key.to_string(), Entry::Loading);
                    return Err(Error::KeyNotLoaded(key.to_string()));
                }
                None => return Err(Error::KeyNotLoaded(key.to_string())),
            }
        };
        unload_session(&session).await
    }

    /// Quiesce every session and refuse further operations. Transactions
    /// already staging run to completion; queued work that has not begun
    /// is rejected with StoreClosed.
    pub async fn close(&self) {
        if self.core().closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(store = %self.core().config.name, "store closing");

        let entries: Vec<(String, Entry)> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.drain().collect()
        };
        let unloads = entries.into_iter().filter_map(|(key, entry)| match entry {
            Entry::Live(session) => Some(async move {
                if let Err(err) = unload_session(&session).await {
                    tracing::warn!(key = %key, ?err, "unload during close failed");
                }
            }),
            // In-flight loads observe the closed flag and clean up
            // themselves.
            Entry::Loading => None,
        });
        futures::future::join_all(unloads).await;

        self.core().cancel.cancel();
        let sweeper = self.inner.sweeper.lock().unwrap().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.core().fanout.close().await;
        tracing::info!(store = %self.core().config.name, "store closed");
    }
}

async fn unload_session(session: &Session) -> Result<()> {
    let shared = &session.shared;
    let (reply, rx) = oneshot::channel();

    match shared.enqueue(Op::Unload { reply }) {
        Ok(()) => {
            let result = rx.await.unwrap_or(Ok(()));
            session.join_worker().await;
            if shared.phase() == Phase::Lost {
                shared.lock.release().await;
                shared.set_phase(Phase::Closed);
            }
            result
        }
        // The worker already exited (lease loss): finish the teardown
        // inline. Release is a no-op from the lost state.
        Err(_) => {
            session.join_worker().await;
            shared.lock.release().await;
            shared.set_phase(Phase::Closed);
            Ok(())
        }
    }
}

async fn sweep_loop(core: Arc<Core>) {
    loop {
        tokio::select! {
            () = core.cancel.cancelled() => return,
            () = tokio::time::sleep(core.config.orphan_sweep_interval) => {}
        }
        match core.orphans.sweep(&core.cancel).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(store = %core.config.name, deleted, "periodic orphan sweep"),
            Err(err) => tracing::warn!(store = %core.config.name, ?err, "periodic orphan sweep failed"),
        }
    }
}
