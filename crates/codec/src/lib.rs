mod envelope;
pub use envelope::{decode, encode, Envelope, Manifest, Meta};

pub mod ptr;
pub use ptr::Pointer;

mod patch;
pub use patch::{apply, diff, Patch, PatchOp};

/// Error is a failure to decode, reassemble, or patch a record.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The envelope bytes don't parse, or parse to an impossible shape.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// A patch operation referenced a path it may not touch.
    #[error("patch {op} at {path:?}: {reason}")]
    Patch {
        op: &'static str,
        path: String,
        reason: String,
    },
}

/// Content hash of an encoded payload: xxh3-64, lowercase hex.
/// Stored in shard manifests and verified after reassembly.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(bytes))
}
