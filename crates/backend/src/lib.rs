use bytes::Bytes;
use std::time::Duration;

mod memory;
pub use memory::{Fault, FaultAction, MemoryDocStore, MemoryLeaseMap};

mod retry;
pub use retry::{retry, Backoff, RetryPolicy};

/// Error is a classified failure of a DocStore or LeaseMap call.
///
/// Classification drives the retry wrapper: Throttled, Timeout and
/// Transient failures are retried under backoff; BudgetExhausted is
/// retried but never consumes an attempt; everything else surfaces
/// immediately to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A compare-and-set write or delete observed a different version
    /// than the caller expected. Callers must re-read, not retry.
    #[error("document version conflict")]
    Conflict,
    #[error("backend throttled the request: {0}")]
    Throttled(String),
    #[error("backend request timed out")]
    Timeout,
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// Request-budget exhaustion. Retryable, but attempts spent waiting
    /// out the budget are not progress and don't count toward the cap.
    #[error("request budget exhausted")]
    BudgetExhausted,
    #[error("terminal backend failure: {0}")]
    Terminal(String),
    /// The caller's cancellation token fired between attempts.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Throttled(_) | Error::Timeout | Error::Transient(_) | Error::BudgetExhausted
        )
    }

    /// True for budget-style errors which retry without consuming an attempt.
    pub fn is_budget(&self) -> bool {
        matches!(self, Error::BudgetExhausted)
    }
}

/// Expect is the version precondition of a compare-and-set write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Expect {
    /// The document must not exist.
    Absent,
    /// The document must exist at exactly this version.
    Version(u64),
    /// No precondition.
    Any,
}

/// Doc is a versioned document body read from a DocStore.
#[derive(Debug, Clone)]
pub struct Doc {
    pub body: Bytes,
    pub version: u64,
}

/// DocStore is a key/value document store with per-key atomic
/// compare-and-set. Calls may fail transiently (throttling, timeouts)
/// and are expected to be wrapped by [`retry`].
#[async_trait::async_trait]
pub trait DocStore: Send + Sync + 'static {
    async fn read(&self, id: &str) -> Result<Option<Doc>, Error>;

    /// Write `body` at `id` iff `expect` holds, returning the new version.
    async fn write(&self, id: &str, expect: Expect, body: Bytes) -> Result<u64, Error>;

    /// Delete the document at `id` iff `expect` holds.
    /// Deleting an absent document under `Expect::Any` is a no-op.
    async fn delete(&self, id: &str, expect: Expect) -> Result<(), Error>;

    /// List document ids beginning with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// LeaseMap is a best-effort shared map of expiring entries, used for
/// coordination across processes that may concurrently touch a key.
#[async_trait::async_trait]
pub trait LeaseMap: Send + Sync + 'static {
    /// Atomically: if the entry at `key` is absent, expired, or already
    /// holds `token`, set it to `token` with the given TTL and return
    /// true. Otherwise leave it alone and return false.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Error>;

    /// Clear the entry at `key` iff it holds `token`. Idempotent.
    async fn release(&self, key: &str, token: &str) -> Result<(), Error>;

    /// Read the live (unexpired) token at `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<String>, Error>;
}
