//! Atomic multi-key transactions. Participating records are staged with
//! a write-ahead patch embedded in their own documents, then linearized
//! by a single ledger write: before it, every reader reassembles the
//! pre-transaction data; after it, the post-transaction data. Cleanup is
//! best-effort because any reader can finish it later.

use crate::fanout::ChangeEvent;
use crate::queue::{Op, TxSlot};
use crate::session::{self, Phase, RecordState, Shared};
use crate::store::Core;
use crate::{shard, Error, Result};
use backend::{retry, DocStore, Expect, RetryPolicy};
use bytes::Bytes;
use codec::{Meta, Patch};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// The user transform: a synchronous function over deep copies of every
/// participating record's data, keyed by key. Returning false aborts.
pub(crate) type TxFn = Box<dyn FnOnce(&mut BTreeMap<String, Value>) -> bool + Send>;

/// Run a transaction across the given sessions, which the store facade
/// has resolved and sorted by key.
pub(crate) async fn run_tx(
    core: &Arc<Core>,
    participants: Vec<(String, Arc<Shared>)>,
    transform: TxFn,
) -> Result<bool> {
    if core.is_closed() {
        return Err(Error::StoreClosed);
    }
    for (key, shared) in &participants {
        if shared.phase() != Phase::Ready {
            return Err(match shared.phase() {
                Phase::Lost => Error::LockLost(key.clone()),
                _ => Error::KeyNotLoaded(key.clone()),
            });
        }
    }

    // Phase 0: claim every session's tx slot in ascending key order.
    // Marking all keys pending up front closes the update fast path
    // before the first slot is granted.
    for (_, shared) in &participants {
        shared.tx_pending.fetch_add(1, Ordering::SeqCst);
    }

    let mut slots: Vec<(String, TxSlot)> = Vec::with_capacity(participants.len());
    for (index, (key, shared)) in participants.iter().enumerate() {
        let (granted_tx, granted_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();

        let sent = shared
            .enqueue_tx(Op::TxJoin {
                granted: granted_tx,
                release: release_rx,
            })
            .is_ok();
        if !sent {
            // This key's join never reached its worker: unwind our own
            // pending mark, and those of every key not yet enqueued.
            for (_, shared) in &participants[index..] {
                shared.tx_pending.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(shared.reject_error());
        }

        if granted_rx.await.is_err() {
            for (_, shared) in &participants[index + 1..] {
                shared.tx_pending.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(shared.reject_error());
        }
        slots.push((key.clone(), TxSlot::new(shared.clone(), release_tx)));
    }

    // Hold every record mutex for the remaining phases: stragglers that
    // passed the fast-path gate serialize before or after the whole
    // transaction.
    let mut guards = Vec::with_capacity(slots.len());
    for (key, slot) in &slots {
        if !slot.shared.lock.is_locked() {
            return Err(Error::LockLost(key.clone()));
        }
        guards.push(slot.shared.record.lock().await);
    }

    // Phase 1: run the transform over deep copies and compute patches.
    let mut state: BTreeMap<String, Value> = slots
        .iter()
        .zip(guards.iter())
        .map(|((key, _), guard)| (key.clone(), (*guard.data).clone()))
        .collect();

    let verdict = std::panic::catch_unwind(AssertUnwindSafe(|| transform(&mut state)));
    let proceed = match verdict {
        Err(_panic) => {
            let keys: Vec<&str> = slots.iter().map(|(key, _)| key.as_str()).collect();
            return Err(Error::UpdatePanicked(keys.join(",")));
        }
        Ok(proceed) => proceed,
    };
    if !proceed {
        return Ok(false);
    }

    if state.len() != slots.len() || slots.iter().any(|(key, _)| !state.contains_key(key)) {
        return Err(Error::KeysChangedInTransaction);
    }

    let mut changed: Vec<(usize, Value, Patch)> = Vec::new();
    for (index, (key, slot)) in slots.iter().enumerate() {
        let next = state.remove(key).expect("key set was just checked");
        let patch = codec::diff(&guards[index].data, &next);
        if patch.is_empty() {
            continue;
        }
        session::validate_schema(&slot.shared, &next)?;
        changed.push((index, next, patch));
    }

    if changed.is_empty() {
        return Ok(true);
    }
    if changed.len() == 1 {
        // Single-key effect: an ordinary buffered update, no staging.
        let (index, next, _) = changed.pop().expect("one changed entry");
        commit_in_memory(&slots[index].1.shared, &mut guards[index], next);
        return Ok(true);
    }

    // Staging has not begun: a close that raced this far still wins.
    if core.is_closed() {
        return Err(Error::StoreClosed);
    }

    let tx_id = uuid::Uuid::new_v4().simple().to_string();
    tracing::debug!(tx_id = %tx_id, keys = changed.len(), "staging transaction");

    // Phases 2-4 must survive store close; they cancel only on the
    // participant's own lease loss, checked per write.
    let io_cancel = CancellationToken::new();

    // Phase 2: stage every changed record, ascending.
    for staged_so_far in 0..changed.len() {
        let (index, _, patch) = &changed[staged_so_far];
        let (key, slot) = &slots[*index];
        let guard = &mut guards[*index];

        let result = stage_record(core, key, slot, guard, &tx_id, patch, &io_cancel).await;
        if let Err(err) = result {
            tracing::warn!(tx_id = %tx_id, key, ?err, "staging failed; rolling back");
            rollback(core, &slots, &mut guards, &changed[..staged_so_far], &io_cancel).await;
            return Err(err);
        }
    }

    // Phase 3: the commit point. Retried indefinitely; once durable,
    // every future reader applies the staged patches.
    let ledger_body = Bytes::from_static(b"true");
    let unbounded = RetryPolicy::new(u32::MAX);
    retry(&unbounded, &io_cancel, "ledger write", || {
        core.docs.write(&tx_id, Expect::Any, ledger_body.clone())
    })
    .await?;
    tracing::debug!(tx_id = %tx_id, "transaction committed");

    // Phase 4: collapse staging in memory and on disk. Failures are
    // logged, not fatal: the ledger already decides the outcome and the
    // next load of a straggler heals it.
    for (index, next, _) in changed {
        let (key, slot) = &slots[index];
        let guard = &mut guards[index];

        let old = guard.data.clone();
        guard.data = Arc::new(next);
        guard.staged_tx = None;
        guard.dirty = false;

        let meta = Meta {
            applied_migrations: guard.applied_migrations.clone(),
            shard_ids: Vec::new(),
            active_tx_id: None,
            committed_data: None,
            tx_patch: None,
        };
        let expect = expect_of(guard);
        match shard::write_record(
            core,
            key,
            &guard.data,
            meta,
            expect,
            &guard.shard_ids,
            &io_cancel,
        )
        .await
        {
            Ok(outcome) => {
                guard.version = Some(outcome.version);
                guard.shard_ids = outcome.shard_ids;
            }
            Err(err) => {
                tracing::warn!(tx_id = %tx_id, key, ?err, "cleanup write failed; staged record heals on next save or load");
                guard.dirty = true;
                guard.heal_ledger = Some(tx_id.clone());
            }
        }

        core.fanout.send(ChangeEvent {
            key: key.clone(),
            new: guard.data.clone(),
            old: Some(old),
        });
    }

    if let Err(err) = core.docs.delete(&tx_id, Expect::Any).await {
        tracing::warn!(tx_id = %tx_id, ?err, "ledger deletion failed; stale entry is inert");
    }

    Ok(true)
}

fn expect_of(record: &RecordState) -> Expect {
    match record.version {
        Some(version) => Expect::Version(version),
        None => Expect::Absent,
    }
}

fn commit_in_memory(shared: &Arc<Shared>, record: &mut RecordState, next: Value) {
    let old = record.data.clone();
    record.data = Arc::new(next);
    record.dirty = true;
    shared.core.fanout.send(ChangeEvent {
        key: shared.key.clone(),
        new: record.data.clone(),
        old: Some(old),
    });
}

/// Write one record in its staged form: data and committedData both the
/// pre-transaction value (buffered updates become durable with it), plus
/// the write-ahead patch and transaction id.
async fn stage_record(
    core: &Arc<Core>,
    key: &str,
    slot: &TxSlot,
    record: &mut RecordState,
    tx_id: &str,
    patch: &Patch,
    cancel: &CancellationToken,
) -> Result<()> {
    if !slot.shared.lock.is_locked() {
        return Err(Error::LockLost(key.to_string()));
    }

    let meta = Meta {
        applied_migrations: record.applied_migrations.clone(),
        shard_ids: Vec::new(),
        active_tx_id: Some(tx_id.to_string()),
        committed_data: Some((*record.data).clone()),
        tx_patch: Some(patch.clone()),
    };
    let outcome = shard::write_record(
        core,
        key,
        &record.data,
        meta,
        expect_of(record),
        &record.shard_ids,
        cancel,
    )
    .await?;

    record.version = Some(outcome.version);
    record.shard_ids = outcome.shard_ids;
    record.staged_tx = Some(tx_id.to_string());
    record.dirty = false;
    Ok(())
}

/// Unstage every record staged so far after a Phase 2 failure. A record
/// we fail to rewrite stays staged on disk; with no ledger entry it
/// still reassembles to its committed data everywhere.
async fn rollback(
    core: &Arc<Core>,
    slots: &[(String, TxSlot)],
    guards: &mut [tokio::sync::MutexGuard<'_, RecordState>],
    staged: &[(usize, Value, Patch)],
    cancel: &CancellationToken,
) {
    for (index, _, _) in staged {
        let (key, _) = &slots[*index];
        let guard = &mut guards[*index];
        guard.staged_tx = None;

        let meta = Meta {
            applied_migrations: guard.applied_migrations.clone(),
            shard_ids: Vec::new(),
            active_tx_id: None,
            committed_data: None,
            tx_patch: None,
        };
        match shard::write_record(
            core,
            key,
            &guard.data,
            meta,
            expect_of(guard),
            &guard.shard_ids,
            cancel,
        )
        .await
        {
            Ok(outcome) => {
                guard.version = Some(outcome.version);
                guard.shard_ids = outcome.shard_ids;
            }
            Err(err) => {
                tracing::warn!(key, ?err, "rollback rewrite failed; staged record is inert without a ledger entry");
            }
        }
    }
}

/// How a record read from the DocStore resolves under the read-tx rule.
pub(crate) struct Resolved {
    pub data: Value,
    /// Ledger to delete once a save has collapsed the staging.
    pub heal_ledger: Option<String>,
    /// True if the record carried staging that a save must collapse.
    pub needs_collapse: bool,
}

/// Apply the read-tx rule to a freshly read record: no staging means the
/// data is authoritative; staging defers to the transaction ledger, and
/// an absent or false ledger entry means the transaction never happened.
pub(crate) async fn resolve_read(
    core: &Core,
    key: &str,
    record: &shard::LoadedRecord,
    cancel: &CancellationToken,
) -> Result<Resolved> {
    let Some(tx_id) = &record.meta.active_tx_id else {
        return Ok(Resolved {
            data: record.data.clone(),
            heal_ledger: None,
            needs_collapse: false,
        });
    };

    let committed = record
        .meta
        .committed_data
        .clone()
        .unwrap_or_else(|| record.data.clone());

    let ledger = retry(&core.policy, cancel, "ledger read", || {
        core.docs.read(tx_id)
    })
    .await?;

    let committed_in_ledger = match ledger {
        None => false,
        Some(doc) => serde_json::from_slice::<bool>(&doc.body)
            .map_err(|err| Error::corrupt(key, format!("unreadable ledger entry: {err}")))?,
    };

    if !committed_in_ledger {
        tracing::debug!(key, tx_id = %tx_id, "staged transaction was never committed; discarding patch");
        return Ok(Resolved {
            data: committed,
            heal_ledger: None,
            needs_collapse: true,
        });
    }

    let patch = record
        .meta
        .tx_patch
        .as_ref()
        .ok_or_else(|| Error::corrupt(key, "staged record is missing its patch"))?;
    let data = codec::apply(&committed, patch).map_err(|err| Error::corrupt(key, err))?;

    tracing::debug!(key, tx_id = %tx_id, "applied committed transaction patch at read");
    Ok(Resolved {
        data,
        heal_ledger: Some(tx_id.clone()),
        needs_collapse: true,
    })
}
