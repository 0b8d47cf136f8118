use super::{Doc, DocStore, Error, Expect, LeaseMap};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// FaultAction is what a matched fault does to the intercepted call.
#[derive(Debug, Clone)]
pub enum FaultAction {
    /// Fail the call with this error.
    Error(Error),
    /// Never resolve. Combined with aborting the caller's task, this
    /// simulates a process crash at an exact point in a protocol.
    Hang,
}

/// Fault is a scripted interception of MemoryDocStore calls, matched by
/// operation kind and document-id prefix.
#[derive(Debug, Clone)]
pub struct Fault {
    pub op: &'static str,
    pub id_prefix: String,
    pub action: FaultAction,
    /// Number of matching calls to intercept before the fault is spent.
    pub remaining: u32,
}

#[derive(Default)]
struct DocStoreInner {
    docs: Mutex<BTreeMap<String, (u64, Bytes)>>,
    faults: Mutex<Vec<Fault>>,
}

/// MemoryDocStore is an in-process DocStore with real compare-and-set
/// semantics. Clones share state, so a clone handed to a second Store
/// stands in for another process reopening the same backing data.
#[derive(Clone, Default)]
pub struct MemoryDocStore {
    inner: Arc<DocStoreInner>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a fault against future calls. Faults are consulted in
    /// insertion order; the first live match fires.
    pub fn push_fault(&self, fault: Fault) {
        self.inner.faults.lock().unwrap().push(fault);
    }

    /// Raw snapshot of every stored document id, for test assertions.
    pub fn ids(&self) -> Vec<String> {
        self.inner.docs.lock().unwrap().keys().cloned().collect()
    }

    async fn check_fault(&self, op: &'static str, id: &str) -> Result<(), Error> {
        let action = {
            let mut faults = self.inner.faults.lock().unwrap();
            let matched = faults
                .iter_mut()
                .find(|f| f.remaining > 0 && f.op == op && id.starts_with(&f.id_prefix));
            match matched {
                Some(fault) => {
                    fault.remaining -= 1;
                    Some(fault.action.clone())
                }
                None => None,
            }
        };
        match action {
            None => Ok(()),
            Some(FaultAction::Error(err)) => {
                tracing::debug!(op, id, ?err, "scripted fault fired");
                Err(err)
            }
            Some(FaultAction::Hang) => {
                tracing::debug!(op, id, "scripted hang fired");
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[async_trait::async_trait]
impl DocStore for MemoryDocStore {
    async fn read(&self, id: &str) -> Result<Option<Doc>, Error> {
        self.check_fault("read", id).await?;
        let docs = self.inner.docs.lock().unwrap();
        Ok(docs.get(id).map(|(version, body)| Doc {
            body: body.clone(),
            version: *version,
        }))
    }

    async fn write(&self, id: &str, expect: Expect, body: Bytes) -> Result<u64, Error> {
        self.check_fault("write", id).await?;
        let mut docs = self.inner.docs.lock().unwrap();
        let current = docs.get(id).map(|(version, _)| *version);

        let next = match (expect, current) {
            (Expect::Absent, None) => 1,
            (Expect::Version(v), Some(cur)) if v == cur => cur + 1,
            (Expect::Any, cur) => cur.unwrap_or(0) + 1,
            _ => return Err(Error::Conflict),
        };
        docs.insert(id.to_string(), (next, body));
        Ok(next)
    }

    async fn delete(&self, id: &str, expect: Expect) -> Result<(), Error> {
        self.check_fault("delete", id).await?;
        let mut docs = self.inner.docs.lock().unwrap();
        let current = docs.get(id).map(|(version, _)| *version);

        match (expect, current) {
            (Expect::Any, _) => {
                docs.remove(id);
                Ok(())
            }
            (Expect::Version(v), Some(cur)) if v == cur => {
                docs.remove(id);
                Ok(())
            }
            (Expect::Absent, None) => Ok(()),
            _ => Err(Error::Conflict),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.check_fault("list", prefix).await?;
        let docs = self.inner.docs.lock().unwrap();
        Ok(docs
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }
}

struct Lease {
    token: String,
    expires: Instant,
}

/// MemoryLeaseMap is an in-process LeaseMap with TTL expiry measured on
/// the tokio clock, so paused-time tests can step leases to expiry.
#[derive(Clone, Default)]
pub struct MemoryLeaseMap {
    entries: Arc<Mutex<HashMap<String, Lease>>>,
}

impl MemoryLeaseMap {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LeaseMap for MemoryLeaseMap {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Error> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        match entries.get(key) {
            Some(lease) if lease.expires > now && lease.token != token => Ok(false),
            _ => {
                entries.insert(
                    key.to_string(),
                    Lease {
                        token: token.to_string(),
                        expires: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(|lease| lease.token == token) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, Error> {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|lease| lease.expires > now)
            .map(|lease| lease.token.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn docstore_cas_semantics() {
        let docs = MemoryDocStore::new();

        let v1 = docs
            .write("a", Expect::Absent, Bytes::from_static(b"one"))
            .await
            .unwrap();
        assert_eq!(v1, 1);

        // A second create must conflict.
        let err = docs
            .write("a", Expect::Absent, Bytes::from_static(b"two"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict));

        let v2 = docs
            .write("a", Expect::Version(v1), Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let err = docs
            .write("a", Expect::Version(v1), Bytes::from_static(b"three"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict));

        assert_eq!(docs.read("a").await.unwrap().unwrap().body.as_ref(), b"two");
        docs.delete("a", Expect::Version(v2)).await.unwrap();
        assert!(docs.read("a").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn leases_expire_and_refresh() {
        let leases = MemoryLeaseMap::new();
        let ttl = Duration::from_secs(10);

        assert!(leases.acquire("k", "alpha", ttl).await.unwrap());
        assert!(!leases.acquire("k", "beta", ttl).await.unwrap());
        // The holder may refresh its own lease.
        assert!(leases.acquire("k", "alpha", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(leases.read("k").await.unwrap(), None);
        assert!(leases.acquire("k", "beta", ttl).await.unwrap());

        leases.release("k", "alpha").await.unwrap(); // wrong token: no-op
        assert_eq!(leases.read("k").await.unwrap().as_deref(), Some("beta"));
        leases.release("k", "beta").await.unwrap();
        assert_eq!(leases.read("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scripted_faults_fire_once() {
        let docs = MemoryDocStore::new();
        docs.push_fault(Fault {
            op: "write",
            id_prefix: "a".to_string(),
            action: FaultAction::Error(Error::Throttled("busy".to_string())),
            remaining: 1,
        });

        let err = docs
            .write("a", Expect::Any, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Throttled(_)));

        // Spent fault no longer fires.
        docs.write("a", Expect::Any, Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
}
