//! Persistent queue of shard documents dropped by size-shrinking
//! writes. Ids are appended durably before the shards are deleted, so a
//! crashed deletion is retried by a later sweep; the queue document is
//! consulted at store open and periodically while running.

use crate::Error;
use backend::{retry, DocStore, Expect, RetryPolicy};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Bound on read-modify-write rounds when several processes contend for
/// the queue document.
const CAS_ROUNDS: u32 = 8;

#[derive(Clone)]
pub(crate) struct OrphanQueue {
    docs: Arc<dyn DocStore>,
    doc_id: String,
    policy: RetryPolicy,
}

impl OrphanQueue {
    pub fn new(docs: Arc<dyn DocStore>, doc_id: String, policy: RetryPolicy) -> Self {
        Self {
            docs,
            doc_id,
            policy,
        }
    }

    async fn read_queue(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Vec<String>, Expect), Error> {
        let doc = retry(&self.policy, cancel, "orphan queue read", || {
            self.docs.read(&self.doc_id)
        })
        .await?;
        match doc {
            None => Ok((Vec::new(), Expect::Absent)),
            Some(doc) => {
                let ids: Vec<String> = serde_json::from_slice(&doc.body)
                    .map_err(|err| Error::corrupt(&self.doc_id, err))?;
                Ok((ids, Expect::Version(doc.version)))
            }
        }
    }

    async fn write_queue(
        &self,
        ids: &[String],
        expect: Expect,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        let body = Bytes::from(serde_json::to_vec(ids).expect("id list serializes"));
        let result = retry(&self.policy, cancel, "orphan queue write", || {
            self.docs.write(&self.doc_id, expect, body.clone())
        })
        .await;
        match result {
            Ok(_) => Ok(true),
            Err(backend::Error::Conflict) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Durably append ids to the queue. Must succeed before the caller
    /// may delete the shards it is orphaning.
    pub async fn append(&self, orphaned: &[String], cancel: &CancellationToken) -> Result<(), Error> {
        if orphaned.is_empty() {
            return Ok(());
        }
        for _ in 0..CAS_ROUNDS {
            let (mut ids, expect) = self.read_queue(cancel).await?;
            ids.extend(orphaned.iter().cloned());
            ids.dedup();
            if self.write_queue(&ids, expect, cancel).await? {
                tracing::debug!(queue = %self.doc_id, appended = orphaned.len(), "enqueued orphaned shards");
                return Ok(());
            }
        }
        Err(Error::Backend(backend::Error::Conflict))
    }

    /// Drop ids whose documents were successfully deleted by the caller.
    pub async fn remove(&self, deleted: &[String], cancel: &CancellationToken) -> Result<(), Error> {
        if deleted.is_empty() {
            return Ok(());
        }
        for _ in 0..CAS_ROUNDS {
            let (mut ids, expect) = self.read_queue(cancel).await?;
            ids.retain(|id| !deleted.contains(id));
            if self.write_queue(&ids, expect, cancel).await? {
                return Ok(());
            }
        }
        // Leaving the ids queued is harmless: a later sweep deletes the
        // already-absent documents and drops them then.
        tracing::debug!(queue = %self.doc_id, "orphan dequeue lost its races; deferring to sweep");
        Ok(())
    }

    /// Attempt to delete every queued orphan, rewriting the queue with
    /// whatever survives. Returns the number of documents deleted.
    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<usize, Error> {
        let (ids, expect) = self.read_queue(cancel).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut survivors = Vec::new();
        let mut deleted = 0;
        for id in &ids {
            match retry(&self.policy, cancel, "orphan delete", || {
                self.docs.delete(id, Expect::Any)
            })
            .await
            {
                Ok(()) => deleted += 1,
                Err(err) => {
                    tracing::warn!(orphan = %id, ?err, "orphan deletion failed; kept for a future sweep");
                    survivors.push(id.clone());
                }
            }
        }

        // A lost CAS means another process is also sweeping; its rewrite
        // carries the surviving ids.
        if !self.write_queue(&survivors, expect, cancel).await? {
            tracing::debug!(queue = %self.doc_id, "orphan queue rewrite lost a race");
        }
        if deleted > 0 {
            tracing::info!(queue = %self.doc_id, deleted, remaining = survivors.len(), "swept orphaned shards");
        }
        Ok(deleted)
    }
}
