//! Kernel-side submission into the handler context.
//!
//! Three entry points, chosen by what the kernel expects back:
//! - [`Dispatcher::submit`] for operations with a reply handle. Never blocks.
//! - [`Dispatcher::notify`] for init and destroy. Blocks until the handler
//!   acknowledges.
//! - [`Dispatcher::post`] for forget-style notices. Never blocks, no reply.

use crate::error::{BridgeError, HandoffFailure, Result};
use crate::handle::KernelHandle;
use crate::op::{Caller, OpNotice, OpParams, OpRequest};
use crate::registry::{PendingRegistry, RequestId};
use crate::reply::Completion;
use crate::stats::BridgeStats;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Acknowledgement of a lifecycle notification: `Err(errno)` vetoes init.
pub type LifecycleAck = std::result::Result<(), i32>;

/// Message from the kernel side to the handler context.
#[derive(Debug)]
pub enum HandlerMessage {
    /// A registered operation; resolve it through the resolver by id.
    Request(OpRequest),
    /// A notice that expects no reply.
    Notice(OpNotice),
    /// Init or destroy; the kernel thread waits on `ack`.
    Lifecycle {
        notice: OpNotice,
        ack: oneshot::Sender<LifecycleAck>,
    },
}

/// Creates the bounded kernel-to-handler channel.
pub fn handoff_channel(
    capacity: usize,
) -> (mpsc::Sender<HandlerMessage>, mpsc::Receiver<HandlerMessage>) {
    mpsc::channel(capacity)
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<PendingRegistry>,
    tx: mpsc::Sender<HandlerMessage>,
    stats: Arc<BridgeStats>,
    trace_ops: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PendingRegistry>,
        tx: mpsc::Sender<HandlerMessage>,
        stats: Arc<BridgeStats>,
        trace_ops: bool,
    ) -> Self {
        Dispatcher {
            registry,
            tx,
            stats,
            trace_ops,
        }
    }

    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    /// Registers `handle` and hands the operation to the handler.
    ///
    /// On rejection the entry is withdrawn and `handle` is completed with
    /// EIO before returning, so the handle is never left pending.
    pub fn submit(
        &self,
        caller: Caller,
        params: OpParams,
        handle: Box<dyn KernelHandle>,
    ) -> Result<RequestId> {
        let kind = params.kind();
        if !kind.needs_handle() {
            handle.complete(Completion::Errno(libc::EIO));
            return Err(BridgeError::InvalidArgument {
                msg: format!("{} does not take a reply handle", kind),
            });
        }
        if params.has_truncated_field() {
            debug!("{} request from pid {} has a truncated field", kind, caller.pid);
        }

        let id = self.registry.insert(handle, kind, params.budget());
        if self.trace_ops {
            debug!(id = id.0, unique = caller.unique, ?params, "submit {}", kind);
        }

        let request = OpRequest { id, caller, params };
        match self.tx.try_send(HandlerMessage::Request(request)) {
            Ok(()) => {
                self.stats.record_submitted();
                Ok(id)
            }
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => HandoffFailure::Full,
                    TrySendError::Closed(_) => HandoffFailure::Closed,
                };
                self.stats.record_handoff_failure();
                warn!("handoff of {} request {} failed: {}", kind, id, reason);
                if let Some(entry) = self.registry.remove(id) {
                    entry.handle.complete(Completion::Errno(libc::EIO));
                }
                Err(BridgeError::HandoffRejected { id: id.0, reason })
            }
        }
    }

    /// Delivers init or destroy and waits for the handler's answer.
    ///
    /// Must be called from a thread outside the tokio runtime, which is
    /// where fuser runs its callbacks.
    pub fn notify(&self, caller: Caller, params: OpParams) -> LifecycleAck {
        let kind = params.kind();
        if !kind.is_lifecycle() {
            warn!("{} is not a lifecycle notification", kind);
            return Err(libc::EINVAL);
        }
        if self.trace_ops {
            debug!(unique = caller.unique, "notify {}", kind);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let message = HandlerMessage::Lifecycle {
            notice: OpNotice { caller, params },
            ack: ack_tx,
        };
        if self.tx.blocking_send(message).is_err() {
            let err = BridgeError::HandlerGone;
            warn!("{} before {}", err, kind);
            return Err(err.to_errno());
        }
        self.stats.record_notice();
        match ack_rx.blocking_recv() {
            Ok(ack) => ack,
            Err(_) => {
                warn!("handler dropped {} without acknowledging", kind);
                Err(libc::EIO)
            }
        }
    }

    /// Sends a notice that needs no reply. Returns false if it was dropped.
    pub fn post(&self, caller: Caller, params: OpParams) -> bool {
        let kind = params.kind();
        if self.trace_ops {
            debug!(unique = caller.unique, ?params, "post {}", kind);
        }
        match self.tx.try_send(HandlerMessage::Notice(OpNotice { caller, params })) {
            Ok(()) => {
                self.stats.record_notice();
                true
            }
            Err(e) => {
                self.stats.record_dropped_notice();
                let reason = match e {
                    TrySendError::Full(_) => HandoffFailure::Full,
                    TrySendError::Closed(_) => HandoffFailure::Closed,
                };
                warn!("dropping {} notice: {}", kind, reason);
                false
            }
        }
    }
}
