//! Per-session operation queue. Every session owns a FIFO of operations
//! drained serially by its worker task; updates may bypass the queue on
//! the fast path when no transaction is pending for the key.

use crate::session::Shared;
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A synchronous update transform. Runs on a non-suspending frame
/// against the session's working data; returning false aborts.
pub(crate) type UpdateFn = Box<dyn FnOnce(&mut Value) -> bool + Send>;

pub(crate) enum Op {
    Update {
        transform: UpdateFn,
        reply: oneshot::Sender<Result<bool>>,
    },
    Save {
        reply: oneshot::Sender<Result<()>>,
    },
    /// A transaction coordinator claiming this session's tx slot. The
    /// worker acknowledges via `granted`, then parks until `release`
    /// resolves (the coordinator dropping its end counts).
    TxJoin {
        granted: oneshot::Sender<()>,
        release: oneshot::Receiver<()>,
    },
    Unload {
        reply: oneshot::Sender<Result<()>>,
    },
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Update { .. } => "update",
            Op::Save { .. } => "save",
            Op::TxJoin { .. } => "tx-join",
            Op::Unload { .. } => "unload",
        }
    }

    /// Resolve this operation with `err` without running it.
    pub fn reject(self, err: crate::Error) {
        match self {
            Op::Update { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Op::Save { reply } | Op::Unload { reply } => {
                let _ = reply.send(Err(err));
            }
            // Dropping `granted` tells the coordinator this key is gone.
            Op::TxJoin { .. } => {}
        }
    }
}

/// Exclusive transactional access to one session, held by a coordinator
/// from Phase 0 until commit or abort. Dropping the slot resumes the
/// session's worker.
pub(crate) struct TxSlot {
    pub shared: Arc<Shared>,
    _release: oneshot::Sender<()>,
}

impl TxSlot {
    pub fn new(shared: Arc<Shared>, release: oneshot::Sender<()>) -> Self {
        Self {
            shared,
            _release: release,
        }
    }
}
