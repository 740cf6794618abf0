//! Handler execution context.
//!
//! Handlers either drain a [`HandlerInbox`] themselves and call the
//! [`Resolver`] when each operation is decided, or implement [`OpHandler`]
//! and let [`serve`] do both.

use crate::dispatch::{HandlerMessage, LifecycleAck};
use crate::op::{Caller, OpParams};
use crate::registry::RequestId;
use crate::reply::Reply;
use crate::resolve::Resolver;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Receiving end of the kernel-to-handler channel.
pub struct HandlerInbox {
    rx: mpsc::Receiver<HandlerMessage>,
}

impl HandlerInbox {
    pub fn new(rx: mpsc::Receiver<HandlerMessage>) -> Self {
        HandlerInbox { rx }
    }

    pub async fn recv(&mut self) -> Option<HandlerMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HandlerMessage> {
        self.rx.try_recv().ok()
    }

    /// For handlers running on their own thread outside tokio.
    pub fn blocking_recv(&mut self) -> Option<HandlerMessage> {
        self.rx.blocking_recv()
    }

    /// Stops accepting messages. Further submissions fail with EIO.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Decides filesystem operations.
#[async_trait]
pub trait OpHandler: Send + Sync + 'static {
    /// Produces the reply for one registered operation. An `Err` answers
    /// the kernel with the errno it carries, see `Reply`'s `From<io::Error>`.
    async fn handle(&self, caller: Caller, params: OpParams) -> io::Result<Reply>;

    /// Called once at mount. An `Err(errno)` refuses the mount.
    async fn init(&self, _caller: Caller) -> LifecycleAck {
        Ok(())
    }

    /// Called once at unmount.
    async fn destroy(&self, _caller: Caller) {}

    /// Forget and batch-forget notices. Each runs on its own task.
    async fn notice(&self, _caller: Caller, _params: OpParams) {}
}

/// Drains `inbox`, running each operation on its own task and resolving it
/// with the handler's reply. Returns after destroy or when the kernel side
/// is gone.
pub async fn serve<H: OpHandler>(mut inbox: HandlerInbox, resolver: Resolver, handler: Arc<H>) {
    while let Some(message) = inbox.recv().await {
        match message {
            HandlerMessage::Request(request) => {
                let handler = handler.clone();
                let resolver = resolver.clone();
                tokio::spawn(run_one(handler, resolver, request.id, request.caller, request.params));
            }
            HandlerMessage::Notice(notice) => {
                let handler = handler.clone();
                tokio::spawn(async move { handler.notice(notice.caller, notice.params).await });
            }
            HandlerMessage::Lifecycle { notice, ack } => {
                let destroy = notice.params == OpParams::Destroy;
                let result = if destroy {
                    handler.destroy(notice.caller).await;
                    Ok(())
                } else {
                    handler.init(notice.caller).await
                };
                if ack.send(result).is_err() {
                    debug!("kernel stopped waiting for lifecycle acknowledgement");
                }
                if destroy {
                    break;
                }
            }
        }
    }
    debug!("handler loop finished, {} requests pending", resolver.pending());
}

async fn run_one<H: OpHandler>(
    handler: Arc<H>,
    resolver: Resolver,
    id: RequestId,
    caller: Caller,
    params: OpParams,
) {
    let task = tokio::spawn(async move { handler.handle(caller, params).await });
    let reply = match task.await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            debug!("handler failed request {}: {}", id, e);
            Reply::from(e)
        }
        Err(e) => {
            error!("handler task for request {} failed: {}", id, e);
            Reply::Error(libc::EIO)
        }
    };
    resolver.resolve(id, reply);
}
