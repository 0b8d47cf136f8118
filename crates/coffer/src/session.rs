//! The per-key session: a state machine mediating every operation
//! against one record. A session owns the record's lock, an in-memory
//! working copy with a pending-change flag, and a worker task draining
//! the operation queue; saves flush the working copy back to the
//! DocStore through the shard manager.

use crate::fanout::ChangeEvent;
use crate::lock::LockHandle;
use crate::queue::{Op, UpdateFn};
use crate::store::Core;
use crate::{shard, Error, Result};
use backend::{DocStore, Expect};
use codec::Meta;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    Ready,
    Unloading,
    Lost,
    Closed,
}

pub(crate) struct RecordState {
    /// Working data: the last durable snapshot plus buffered updates.
    pub data: Arc<Value>,
    /// DocStore version of the primary document; None until first save
    /// creates it.
    pub version: Option<u64>,
    /// Documents currently storing the record (primary when inline).
    pub shard_ids: Vec<String>,
    pub applied_migrations: Vec<String>,
    /// Id of the transaction staged against this key, while its durable
    /// form carries a write-ahead patch pending the ledger's commit bit.
    pub staged_tx: Option<String>,
    /// Ledger document to delete once staging has been collapsed by a
    /// successful save.
    pub heal_ledger: Option<String>,
    pub dirty: bool,
}

impl RecordState {
    pub fn fresh(data: Value, applied_migrations: Vec<String>) -> Self {
        Self {
            data: Arc::new(data),
            version: None,
            shard_ids: Vec::new(),
            applied_migrations,
            staged_tx: None,
            heal_ledger: None,
            // A fresh record exists only in memory until its first save.
            dirty: true,
        }
    }
}

pub(crate) struct Shared {
    pub key: String,
    pub core: Arc<Core>,
    pub record: tokio::sync::Mutex<RecordState>,
    phase: std::sync::Mutex<Phase>,
    /// Transaction joins enqueued but not yet granted; disables the
    /// update fast path.
    pub tx_pending: AtomicUsize,
    /// A coordinator currently holds this session's tx slot.
    pub tx_active: AtomicBool,
    pub lock: LockHandle,
    ops_tx: mpsc::UnboundedSender<Op>,
    /// Transaction joins bypass queued-but-unstarted work: from Phase 0
    /// on, new non-tx operations wait behind the transaction.
    tx_ops_tx: mpsc::UnboundedSender<Op>,
}

impl Shared {
    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    pub fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
    }

    /// The rejection matching the session's current state.
    pub fn reject_error(&self) -> Error {
        match self.phase() {
            Phase::Lost => Error::LockLost(self.key.clone()),
            _ if self.core.is_closed() => Error::StoreClosed,
            Phase::Ready | Phase::Unloading | Phase::Closed => {
                Error::KeyNotLoaded(self.key.clone())
            }
        }
    }

    /// An update may run immediately, out of queue order, only while no
    /// transaction is queued or holding this session.
    pub fn fast_path_allowed(&self) -> bool {
        self.phase() == Phase::Ready
            && self.tx_pending.load(Ordering::SeqCst) == 0
            && !self.tx_active.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, op: Op) -> Result<()> {
        let kind = op.kind();
        self.ops_tx.send(op).map_err(|_| {
            tracing::debug!(key = %self.key, kind, "operation arrived after session worker exited");
            self.reject_error()
        })
    }

    pub fn enqueue_tx(&self, op: Op) -> Result<()> {
        self.tx_ops_tx.send(op).map_err(|_| self.reject_error())
    }
}

pub(crate) struct Session {
    pub shared: Arc<Shared>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    /// Spawn a session in the Ready state over an already-loaded record.
    pub fn spawn(key: String, core: Arc<Core>, lock: LockHandle, record: RecordState) -> Session {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (tx_ops_tx, tx_ops_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            key,
            core,
            record: tokio::sync::Mutex::new(record),
            phase: std::sync::Mutex::new(Phase::Ready),
            tx_pending: AtomicUsize::new(0),
            tx_active: AtomicBool::new(false),
            lock,
            ops_tx,
            tx_ops_tx,
        });

        // Flip the phase the instant the lease is lost, even if the
        // worker is parked inside a transaction join.
        let weak = Arc::downgrade(&shared);
        shared.lock.on_lost(move || {
            if let Some(shared) = weak.upgrade() {
                shared.set_phase(Phase::Lost);
            }
        });

        let worker = tokio::spawn(run_worker(shared.clone(), ops_rx, tx_ops_rx));
        Session {
            shared,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Wait for the worker to finish after an Unload was enqueued, or
    /// after loss.
    pub async fn join_worker(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    mut ops: mpsc::UnboundedReceiver<Op>,
    mut tx_ops: mpsc::UnboundedReceiver<Op>,
) {
    let lost = shared.lock.lost_token();
    let period = shared.core.config.autosave_interval;
    let mut autosave = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    autosave.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = lost.cancelled() => {
                lost_cleanup(&shared, &mut ops, &mut tx_ops).await;
                return;
            }
            op = tx_ops.recv() => {
                let Some(op) = op else { return };
                if handle_op(&shared, op).await.is_break() {
                    return;
                }
            }
            op = ops.recv() => {
                let Some(op) = op else { return };
                if handle_op(&shared, op).await.is_break() {
                    return;
                }
            }
            _ = autosave.tick() => {
                autosave_tick(&shared).await;
            }
        }
    }
}

async fn handle_op(shared: &Arc<Shared>, op: Op) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    let closed = shared.core.is_closed();
    match op {
        // Operations queued before close but not yet begun are refused.
        op @ (Op::Update { .. } | Op::Save { .. }) if closed => {
            op.reject(Error::StoreClosed);
            ControlFlow::Continue(())
        }
        Op::Update { transform, reply } => {
            let _ = reply.send(do_update(shared, transform, false).await);
            ControlFlow::Continue(())
        }
        Op::Save { reply } => {
            let _ = reply.send(flush(shared).await);
            ControlFlow::Continue(())
        }
        Op::TxJoin { granted, release } => {
            shared.tx_pending.fetch_sub(1, Ordering::SeqCst);
            if shared.phase() != Phase::Ready {
                // Dropping `granted` rejects the coordinator.
                return ControlFlow::Continue(());
            }
            shared.tx_active.store(true, Ordering::SeqCst);
            if granted.send(()).is_ok() {
                // Park until the coordinator commits or aborts.
                let _ = release.await;
            }
            shared.tx_active.store(false, Ordering::SeqCst);
            ControlFlow::Continue(())
        }
        Op::Unload { reply } => {
            let _ = reply.send(do_unload(shared).await);
            ControlFlow::Break(())
        }
    }
}

async fn autosave_tick(shared: &Arc<Shared>) {
    if shared.phase() != Phase::Ready {
        return;
    }
    let dirty = shared.record.lock().await.dirty;
    if !dirty {
        return;
    }
    match flush(shared).await {
        Ok(()) => tracing::debug!(key = %shared.key, "autosave flushed"),
        Err(err) => tracing::warn!(key = %shared.key, ?err, "autosave failed; will retry next tick"),
    }
}

async fn lost_cleanup(
    shared: &Arc<Shared>,
    ops: &mut mpsc::UnboundedReceiver<Op>,
    tx_ops: &mut mpsc::UnboundedReceiver<Op>,
) {
    shared.set_phase(Phase::Lost);
    ops.close();
    tx_ops.close();
    let mut drain = |op: Op| match op {
        Op::TxJoin { .. } => {
            shared.tx_pending.fetch_sub(1, Ordering::SeqCst);
        }
        // Unloading a lost session is still a successful teardown;
        // there is nothing left to flush or release.
        Op::Unload { reply } => {
            let _ = reply.send(Ok(()));
        }
        op => op.reject(Error::LockLost(shared.key.clone())),
    };
    while let Ok(op) = tx_ops.try_recv() {
        drain(op);
    }
    while let Ok(op) = ops.try_recv() {
        drain(op);
    }
    tracing::warn!(key = %shared.key, "session lost its lease; queued operations rejected");
}

/// Run one update transform against the session's data. `fast` marks a
/// fast-path invocation running on the caller's task.
pub(crate) async fn do_update(
    shared: &Arc<Shared>,
    transform: UpdateFn,
    fast: bool,
) -> Result<bool> {
    if shared.phase() != Phase::Ready {
        return Err(shared.reject_error());
    }
    if !shared.lock.is_locked() {
        return Err(Error::LockLost(shared.key.clone()));
    }

    let mut record = shared.record.lock().await;

    // Reference protection may only be waived on the fast path, and
    // never when observers need a before-snapshot.
    let in_place = fast
        && shared.core.config.disable_reference_protection
        && !shared.core.fanout.is_active();

    if in_place {
        let working = Arc::make_mut(&mut record.data);
        let verdict = std::panic::catch_unwind(AssertUnwindSafe(|| transform(working)));
        return match verdict {
            Err(_panic) => Err(Error::UpdatePanicked(shared.key.clone())),
            Ok(false) => Ok(false),
            Ok(true) => {
                validate_schema(shared, &record.data)?;
                record.dirty = true;
                Ok(true)
            }
        };
    }

    let mut working = (*record.data).clone();
    let verdict = std::panic::catch_unwind(AssertUnwindSafe(|| transform(&mut working)));
    match verdict {
        Err(_panic) => Err(Error::UpdatePanicked(shared.key.clone())),
        Ok(false) => Ok(false),
        Ok(true) => {
            validate_schema(shared, &working)?;
            let old = record.data.clone();
            record.data = Arc::new(working);
            record.dirty = true;
            shared.core.fanout.send(ChangeEvent {
                key: shared.key.clone(),
                new: record.data.clone(),
                old: Some(old),
            });
            Ok(true)
        }
    }
}

pub(crate) fn validate_schema(shared: &Shared, data: &Value) -> Result<()> {
    let Some(schema) = &shared.core.config.schema else {
        return Ok(());
    };
    schema(data).map_err(|reason| Error::SchemaFailed {
        key: shared.key.clone(),
        reason,
    })
}

/// Flush the working copy to the DocStore if anything is pending.
pub(crate) async fn flush(shared: &Arc<Shared>) -> Result<()> {
    let mut record = shared.record.lock().await;
    flush_locked(shared, &mut record).await
}

pub(crate) async fn flush_locked(shared: &Shared, record: &mut RecordState) -> Result<()> {
    if !record.dirty && record.version.is_some() {
        return Ok(());
    }
    if !shared.lock.is_locked() {
        return Err(Error::LockLost(shared.key.clone()));
    }
    // A coordinator holds the record mutex for the whole staging window,
    // so staging seen here belongs to an abandoned transaction; writing
    // the clean record collapses it.
    if let Some(tx_id) = record.staged_tx.take() {
        tracing::debug!(key = %shared.key, tx_id = %tx_id, "collapsing staging left by an abandoned transaction");
    }

    let meta = Meta {
        applied_migrations: record.applied_migrations.clone(),
        shard_ids: Vec::new(),
        active_tx_id: None,
        committed_data: None,
        tx_patch: None,
    };
    let expect = match record.version {
        Some(version) => Expect::Version(version),
        None => Expect::Absent,
    };

    let cancel = shared.lock.lost_token();
    let outcome = shard::write_record(
        &shared.core,
        &shared.key,
        &record.data,
        meta,
        expect,
        &record.shard_ids,
        &cancel,
    )
    .await
    .map_err(|err| match err {
        Error::Backend(backend::Error::Cancelled) => Error::LockLost(shared.key.clone()),
        err => err,
    })?;

    record.version = Some(outcome.version);
    record.shard_ids = outcome.shard_ids;
    record.dirty = false;

    // Staging observed at load time is durably collapsed now; drop the
    // transaction's ledger entry.
    if let Some(ledger_id) = record.heal_ledger.take() {
        if let Err(err) = shared.core.docs.delete(&ledger_id, Expect::Any).await {
            tracing::warn!(key = %shared.key, ledger = %ledger_id, ?err, "stale ledger deletion deferred");
        }
    }

    tracing::debug!(key = %shared.key, version = outcome.version, "record flushed");
    Ok(())
}

async fn do_unload(shared: &Arc<Shared>) -> Result<()> {
    shared.set_phase(Phase::Unloading);

    let flushed = flush(shared).await;
    if let Err(err) = &flushed {
        tracing::error!(key = %shared.key, ?err, "final save on unload failed");
    }

    shared.lock.release().await;
    shared.set_phase(Phase::Closed);
    tracing::debug!(key = %shared.key, "session unloaded");
    flushed
}
