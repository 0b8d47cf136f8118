use super::{Error, Patch};
use bytes::Bytes;
use serde_json::Value;

/// Meta is the bookkeeping section of every primary document.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Meta {
    #[serde(default)]
    pub applied_migrations: Vec<String>,
    #[serde(default)]
    pub shard_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_patch: Option<Patch>,
}

/// Manifest describes a sharded record: the primary document holds only
/// this section plus `meta`, and the payload is reassembled by
/// concatenating shard bodies in `shard_ids` order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    pub shard_ids: Vec<String>,
    pub total_size: u64,
    pub content_hash: String,
}

/// Envelope is the decoded form of a primary document: either an inline
/// `data` payload or a shard `manifest`, never both, plus `meta`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    pub meta: Meta,
}

impl Envelope {
    pub fn inline(data: Value, meta: Meta) -> Self {
        Self {
            data: Some(data),
            manifest: None,
            meta,
        }
    }

    pub fn sharded(manifest: Manifest, meta: Meta) -> Self {
        Self {
            data: None,
            manifest: Some(manifest),
            meta,
        }
    }

    fn check_shape(&self) -> Result<(), Error> {
        match (&self.data, &self.manifest) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(Error::Corrupt(
                "envelope holds both inline data and a shard manifest".to_string(),
            )),
            (None, None) => Err(Error::Corrupt(
                "envelope holds neither inline data nor a shard manifest".to_string(),
            )),
        }
    }
}

/// Encode an envelope to its stored byte form, returning the bytes and
/// their size. The form is UTF-8 JSON, wrapped by the platform's binary
/// blob primitive at the DocStore boundary.
pub fn encode(envelope: &Envelope) -> (Bytes, usize) {
    let vec = serde_json::to_vec(envelope).expect("envelope serialization is infallible");
    let size = vec.len();
    (Bytes::from(vec), size)
}

/// Decode stored bytes back into an envelope. Any envelope-shape
/// mismatch is corruption; the `data` payload itself is validated
/// separately by the store's schema hook.
pub fn decode(bytes: &[u8]) -> Result<Envelope, Error> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|err| Error::Corrupt(err.to_string()))?;
    envelope.check_shape()?;
    Ok(envelope)
}
