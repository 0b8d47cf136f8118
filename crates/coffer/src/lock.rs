//! Distributed locks over the LeaseMap: one live lease per key, held by
//! whichever process most recently won the atomic acquire, refreshed in
//! the background for as long as the session stays open.

use crate::Error;
use backend::{retry, LeaseMap, RetryPolicy};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Slack subtracted from the local expected expiry to absorb clock skew
/// between this process and the LeaseMap.
const EXPIRY_MARGIN: Duration = Duration::from_millis(200);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Fsm {
    Held,
    Lost,
    Released,
}

struct LockState {
    fsm: Fsm,
    expected_expiry: Instant,
}

struct LockShared {
    leases: Arc<dyn LeaseMap>,
    policy: RetryPolicy,
    key: String,
    lock_id: String,
    duration: Duration,
    refresh_interval: Duration,
    state: Mutex<LockState>,
    /// Signals release: halts the refresh loop and pending backoffs.
    cancel: CancellationToken,
    /// Fired exactly once if the lease is lost while notionally held.
    lost: CancellationToken,
    on_lost: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl LockShared {
    fn mark_lost(&self, reason: &str) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.fsm != Fsm::Held {
                return;
            }
            state.fsm = Fsm::Lost;
            std::mem::take(&mut *self.on_lost.lock().unwrap())
        };
        tracing::warn!(key = %self.key, lock_id = %self.lock_id, reason, "lease lost");
        for callback in callbacks {
            callback();
        }
        self.lost.cancel();
    }
}

/// LockManager acquires and probes leases for one store.
#[derive(Clone)]
pub struct LockManager {
    leases: Arc<dyn LeaseMap>,
    policy: RetryPolicy,
}

impl LockManager {
    pub fn new(leases: Arc<dyn LeaseMap>, policy: RetryPolicy) -> Self {
        Self { leases, policy }
    }

    /// True if some process currently holds a live lease for `key`.
    pub async fn probe(&self, key: &str) -> Result<bool, Error> {
        let held = retry(&self.policy, &CancellationToken::new(), "lease probe", || {
            self.leases.read(key)
        })
        .await?;
        Ok(held.is_some())
    }

    /// Acquire the lease for `key`, retrying under backoff until it is
    /// won or `duration` elapses (LockUnavailable). On success a refresh
    /// task reasserts the lease every `refresh_interval` until release.
    pub async fn acquire(
        &self,
        key: &str,
        duration: Duration,
        refresh_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, Error> {
        let lock_id = uuid::Uuid::new_v4().simple().to_string();
        let deadline = Instant::now() + duration;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::StoreClosed);
            }
            let won = retry(&self.policy, cancel, "lease acquire", || {
                self.leases.acquire(key, &lock_id, duration)
            })
            .await
            .map_err(map_cancelled)?;

            if won {
                break;
            }

            attempt += 1;
            let pause = self.policy.delay(attempt).unwrap_or(duration);
            if Instant::now() + pause >= deadline {
                tracing::debug!(key, attempt, "lease acquisition timed out");
                return Err(Error::LockUnavailable(key.to_string()));
            }
            tracing::debug!(key, attempt, ?pause, "lease held elsewhere; backing off");
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = cancel.cancelled() => return Err(Error::StoreClosed),
            }
        }

        let shared = Arc::new(LockShared {
            leases: self.leases.clone(),
            policy: self.policy.clone(),
            key: key.to_string(),
            lock_id,
            duration,
            refresh_interval,
            state: Mutex::new(LockState {
                fsm: Fsm::Held,
                expected_expiry: Instant::now() + duration - EXPIRY_MARGIN,
            }),
            cancel: CancellationToken::new(),
            lost: CancellationToken::new(),
            on_lost: Mutex::new(Vec::new()),
        });

        let refresh = tokio::spawn(refresh_loop(shared.clone()));
        tracing::debug!(key, lock_id = %shared.lock_id, "lease acquired");

        Ok(LockHandle {
            shared,
            refresh: Mutex::new(Some(refresh)),
        })
    }
}

async fn refresh_loop(shared: Arc<LockShared>) {
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => return,
            () = tokio::time::sleep(shared.refresh_interval) => {}
        }

        let expiry = shared.state.lock().unwrap().expected_expiry;
        let outcome = tokio::select! {
            () = shared.cancel.cancelled() => return,
            // The local expiry is the hard bound: past it we may no
            // longer assert the lease, whatever the backend says later.
            () = tokio::time::sleep_until(expiry) => None,
            res = retry(&shared.policy, &shared.cancel, "lease refresh", || {
                shared.leases.acquire(&shared.key, &shared.lock_id, shared.duration)
            }) => Some(res),
        };

        match outcome {
            None => {
                shared.mark_lost("expiry elapsed without a successful refresh");
                return;
            }
            Some(Ok(true)) => {
                let mut state = shared.state.lock().unwrap();
                state.expected_expiry = Instant::now() + shared.duration - EXPIRY_MARGIN;
            }
            Some(Ok(false)) => {
                shared.mark_lost("lease acquired by another holder");
                return;
            }
            Some(Err(backend::Error::Cancelled)) => return,
            Some(Err(err)) => {
                shared.mark_lost(&format!("refresh failed: {err}"));
                return;
            }
        }
    }
}

/// LockHandle is one held lease. Dropping it without `release()` leaves
/// the lease to expire on its own TTL.
pub struct LockHandle {
    shared: Arc<LockShared>,
    refresh: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_id", &self.shared.lock_id)
            .field("key", &self.shared.key)
            .finish()
    }
}

impl LockHandle {
    pub fn lock_id(&self) -> &str {
        &self.shared.lock_id
    }

    /// True only while held and locally unexpired.
    pub fn is_locked(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.fsm == Fsm::Held && state.expected_expiry > Instant::now()
    }

    /// Register a callback invoked exactly once if the lease is lost.
    /// Registration after loss invokes immediately.
    pub fn on_lost(&self, callback: impl FnOnce() + Send + 'static) {
        let already_lost = {
            let state = self.shared.state.lock().unwrap();
            if state.fsm == Fsm::Held {
                self.shared.on_lost.lock().unwrap().push(Box::new(callback));
                return;
            }
            state.fsm == Fsm::Lost
        };
        if already_lost {
            callback();
        }
    }

    /// A token cancelled when the lease is lost, for use in select loops.
    pub(crate) fn lost_token(&self) -> CancellationToken {
        self.shared.lost.clone()
    }

    /// Cancel refresh, let any in-flight call settle, then clear the
    /// lease with a single best-effort update. Idempotent; a no-op from
    /// the lost state.
    pub async fn release(&self) {
        self.shared.cancel.cancel();
        let refresh = self.refresh.lock().unwrap().take();
        if let Some(handle) = refresh {
            let _ = handle.await;
        }

        let was_held = {
            let mut state = self.shared.state.lock().unwrap();
            let was_held = state.fsm == Fsm::Held;
            if state.fsm != Fsm::Lost {
                state.fsm = Fsm::Released;
            }
            was_held
        };
        if !was_held {
            return;
        }
        if let Err(err) = self
            .shared
            .leases
            .release(&self.shared.key, &self.shared.lock_id)
            .await
        {
            tracing::warn!(key = %self.shared.key, ?err, "failed to clear released lease; it will expire by TTL");
        } else {
            tracing::debug!(key = %self.shared.key, "lease released");
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // Stop the refresh loop; an unreleased lease then expires by TTL.
        self.shared.cancel.cancel();
    }
}

fn map_cancelled(err: backend::Error) -> Error {
    match err {
        backend::Error::Cancelled => Error::StoreClosed,
        err => Error::Backend(err),
    }
}
