//! Delivers committed-change notifications to registered observers on a
//! dedicated task, so a slow or panicking observer can neither block nor
//! poison the mutation path.

use crate::ObserverFn;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// ChangeEvent is one committed mutation: the key, the new snapshot,
/// and the prior snapshot (None for the initial load). Snapshots are
/// shared immutably; observers cannot corrupt engine state through them.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub key: String,
    pub new: Arc<Value>,
    pub old: Option<Arc<Value>>,
}

pub(crate) struct Fanout {
    tx: Mutex<Option<mpsc::UnboundedSender<ChangeEvent>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Fanout {
    pub fn new(observers: Vec<ObserverFn>) -> Self {
        if observers.is_empty() {
            return Self {
                tx: Mutex::new(None),
                task: Mutex::new(None),
            };
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for observer in &observers {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| observer(&event)));
                    if result.is_err() {
                        tracing::error!(key = %event.key, "change observer panicked; delivery continues");
                    }
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// True while observers are registered and deliverable.
    pub fn is_active(&self) -> bool {
        self.tx.lock().unwrap().is_some()
    }

    /// Queue an event for delivery. A closed fan-out drops it silently.
    pub fn send(&self, event: ChangeEvent) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Stop accepting events and wait for queued deliveries to drain.
    pub async fn close(&self) {
        self.tx.lock().unwrap().take();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
