//! Reads and writes logical records against the DocStore, splitting an
//! oversized payload across sibling shard documents behind a manifest,
//! and queueing shards dropped by a shrinking write for deletion.

use crate::store::Core;
use crate::Error;
use backend::{retry, DocStore, Expect};
use bytes::Bytes;
use codec::{Envelope, Manifest, Meta};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Reserved headroom per shard document for the blob envelope the
/// platform wraps around each body.
const SHARD_OVERHEAD: usize = 512;

/// Segmenting plan for an oversized payload: K equal-sized segments,
/// each fitting the per-document budget with envelope headroom.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct ShardPlan {
    count: usize,
    segment: usize,
}

impl ShardPlan {
    fn for_payload(len: usize, max_doc_bytes: usize) -> ShardPlan {
        let budget = max_doc_bytes - SHARD_OVERHEAD;
        let count = len.div_ceil(budget).max(1);
        ShardPlan {
            count,
            segment: len.div_ceil(count),
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoadedRecord {
    pub data: Value,
    pub meta: Meta,
    pub version: u64,
}

pub(crate) struct WriteOutcome {
    pub version: u64,
    /// Document ids that now store the data, primary included when inline.
    pub shard_ids: Vec<String>,
}

/// Read and reassemble the record at `key`. Returns None when the
/// primary document is absent.
pub(crate) async fn read_record(
    core: &Core,
    key: &str,
    cancel: &CancellationToken,
) -> Result<Option<LoadedRecord>, Error> {
    let primary_id = core.config.primary_id(key);
    let Some(doc) = retry(&core.policy, cancel, "record read", || {
        core.docs.read(&primary_id)
    })
    .await?
    else {
        return Ok(None);
    };

    let envelope = codec::decode(&doc.body).map_err(|err| Error::corrupt(key, err))?;

    let data = match (envelope.data, envelope.manifest) {
        (Some(data), None) => data,
        (None, Some(manifest)) => reassemble(core, key, &manifest, cancel).await?,
        // decode() rejects the other shapes.
        _ => unreachable!("codec::decode enforces the envelope shape"),
    };

    Ok(Some(LoadedRecord {
        data,
        meta: envelope.meta,
        version: doc.version,
    }))
}

async fn reassemble(
    core: &Core,
    key: &str,
    manifest: &Manifest,
    cancel: &CancellationToken,
) -> Result<Value, Error> {
    let mut payload = Vec::with_capacity(manifest.total_size as usize);
    for shard_id in &manifest.shard_ids {
        let shard = retry(&core.policy, cancel, "shard read", || {
            core.docs.read(shard_id)
        })
        .await?
        .ok_or_else(|| Error::corrupt(key, format!("missing shard document {shard_id:?}")))?;
        payload.extend_from_slice(&shard.body);
    }

    if payload.len() as u64 != manifest.total_size {
        return Err(Error::corrupt(
            key,
            format!(
                "reassembled {} bytes but manifest claims {}",
                payload.len(),
                manifest.total_size
            ),
        ));
    }
    if codec::content_hash(&payload) != manifest.content_hash {
        return Err(Error::corrupt(key, "content hash mismatch after reassembly"));
    }

    serde_json::from_slice(&payload).map_err(|err| Error::corrupt(key, err))
}

/// Write the record at `key`, sharding if the inline encoding exceeds
/// the size budget. `prev_shard_ids` are the documents that stored the
/// record before this write; any no longer referenced are orphaned.
pub(crate) async fn write_record(
    core: &Core,
    key: &str,
    data: &Value,
    mut meta: Meta,
    expect: Expect,
    prev_shard_ids: &[String],
    cancel: &CancellationToken,
) -> Result<WriteOutcome, Error> {
    let primary_id = core.config.primary_id(key);

    meta.shard_ids = vec![primary_id.clone()];
    let inline = Envelope::inline(data.clone(), meta.clone());
    let (bytes, size) = codec::encode(&inline);

    let outcome = if size <= core.config.max_doc_bytes {
        let version = write_doc(core, &primary_id, expect, bytes, cancel).await?;
        WriteOutcome {
            version,
            shard_ids: vec![primary_id.clone()],
        }
    } else {
        write_sharded(core, key, data, meta, expect, cancel).await?
    };

    let orphaned: Vec<String> = prev_shard_ids
        .iter()
        .filter(|id| **id != primary_id && !outcome.shard_ids.contains(id))
        .cloned()
        .collect();
    if !orphaned.is_empty() {
        // Enqueue durably first: a crash between the append and the
        // deletes leaves the ids for a later sweep.
        core.orphans.append(&orphaned, cancel).await?;
        let mut deleted = Vec::with_capacity(orphaned.len());
        for id in &orphaned {
            match retry(&core.policy, cancel, "orphan delete", || {
                core.docs.delete(id, Expect::Any)
            })
            .await
            {
                Ok(()) => deleted.push(id.clone()),
                Err(err) => {
                    tracing::warn!(key, orphan = %id, ?err, "orphaned shard deletion deferred to sweep")
                }
            }
        }
        core.orphans.remove(&deleted, cancel).await?;
    }

    Ok(outcome)
}

async fn write_sharded(
    core: &Core,
    key: &str,
    data: &Value,
    mut meta: Meta,
    expect: Expect,
    cancel: &CancellationToken,
) -> Result<WriteOutcome, Error> {
    let payload = serde_json::to_vec(data).expect("data serializes");
    let plan = ShardPlan::for_payload(payload.len(), core.config.max_doc_bytes);

    let shard_ids: Vec<String> = (0..plan.count)
        .map(|i| core.config.shard_id(key, i))
        .collect();
    for (index, chunk) in payload.chunks(plan.segment).enumerate() {
        let body = Bytes::copy_from_slice(chunk);
        let shard_id = &shard_ids[index];
        retry(&core.policy, cancel, "shard write", || {
            core.docs.write(shard_id, Expect::Any, body.clone())
        })
        .await?;
    }

    let manifest = Manifest {
        shard_ids: shard_ids.clone(),
        total_size: payload.len() as u64,
        content_hash: codec::content_hash(&payload),
    };
    meta.shard_ids = shard_ids.clone();
    let (bytes, _) = codec::encode(&Envelope::sharded(manifest, meta));

    let primary_id = core.config.primary_id(key);
    let version = write_doc(core, &primary_id, expect, bytes, cancel).await?;

    tracing::debug!(key, shards = plan.count, bytes = payload.len(), "wrote sharded record");
    Ok(WriteOutcome { version, shard_ids })
}

async fn write_doc(
    core: &Core,
    id: &str,
    expect: Expect,
    bytes: Bytes,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    Ok(retry(&core.policy, cancel, "record write", || {
        core.docs.write(id, expect, bytes.clone())
    })
    .await?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::StoreConfig;
    use serde_json::json;

    fn small_core() -> (Core, backend::MemoryDocStore) {
        let config = StoreConfig::new("players", json!({})).with_max_doc_bytes(4096);
        Core::for_tests(config)
    }

    fn big_value(factor: usize) -> Value {
        // Comfortably larger than the 4096-byte budget.
        json!({"blob": "x".repeat(factor * 4096)})
    }

    #[test]
    fn shard_plan_segments_fit_the_budget() {
        let plan = ShardPlan::for_payload(3 * 4096, 4096);
        assert!(plan.count >= 3);
        assert!(plan.segment <= 4096 - 512);
        assert!(plan.segment * plan.count >= 3 * 4096);

        // One byte past the budget splits into two even segments.
        let plan = ShardPlan::for_payload(4096 - 512 + 1, 4096);
        assert_eq!(plan.count, 2);
        assert_eq!(plan.segment, 1793);
    }

    #[tokio::test]
    async fn inline_round_trip() {
        let (core, _docs) = small_core();
        let cancel = CancellationToken::new();
        let data = json!({"coins": 3});

        let out = write_record(
            &core,
            "k",
            &data,
            Meta::default(),
            Expect::Absent,
            &[],
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.shard_ids, vec!["players/k".to_string()]);

        let loaded = read_record(&core, "k", &cancel).await.unwrap().unwrap();
        assert_eq!(loaded.data, data);
        assert_eq!(loaded.version, out.version);
        assert_eq!(loaded.meta.shard_ids, vec!["players/k".to_string()]);
    }

    #[tokio::test]
    async fn oversized_record_shards_and_reassembles() {
        let (core, docs) = small_core();
        let cancel = CancellationToken::new();
        let data = big_value(3);

        let out = write_record(
            &core,
            "k",
            &data,
            Meta::default(),
            Expect::Absent,
            &[],
            &cancel,
        )
        .await
        .unwrap();
        assert!(out.shard_ids.len() >= 3);
        assert!(out.shard_ids[0].starts_with("players/k/shard/"));

        let loaded = read_record(&core, "k", &cancel).await.unwrap().unwrap();
        assert_eq!(loaded.data, data);

        // The primary document holds only the manifest.
        let primary = docs.read("players/k").await.unwrap().unwrap();
        let envelope = codec::decode(&primary.body).unwrap();
        assert!(envelope.data.is_none());
        assert_eq!(
            envelope.manifest.unwrap().shard_ids,
            out.shard_ids
        );
    }

    #[tokio::test]
    async fn shrinking_write_orphans_and_deletes_extra_shards() {
        let (core, docs) = small_core();
        let cancel = CancellationToken::new();

        let out = write_record(
            &core,
            "k",
            &big_value(3),
            Meta::default(),
            Expect::Absent,
            &[],
            &cancel,
        )
        .await
        .unwrap();
        let wide = out.shard_ids.clone();

        let out = write_record(
            &core,
            "k",
            &json!({"coins": 1}),
            Meta::default(),
            Expect::Version(out.version),
            &wide,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.shard_ids, vec!["players/k".to_string()]);

        // Every dropped shard is gone; only the primary and the (empty)
        // orphan queue remain.
        let ids = docs.ids();
        assert!(ids.contains(&"players/k".to_string()));
        assert!(!ids.iter().any(|id| id.contains("/shard/")));

        let loaded = read_record(&core, "k", &cancel).await.unwrap().unwrap();
        assert_eq!(loaded.data, json!({"coins": 1}));
    }

    #[tokio::test]
    async fn tampered_shard_is_corrupt() {
        let (core, docs) = small_core();
        let cancel = CancellationToken::new();
        write_record(
            &core,
            "k",
            &big_value(3),
            Meta::default(),
            Expect::Absent,
            &[],
            &cancel,
        )
        .await
        .unwrap();

        docs
            .write(
                "players/k/shard/0",
                Expect::Any,
                Bytes::from_static(b"garbage"),
            )
            .await
            .unwrap();

        let err = read_record(&core, "k", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
    }
}
