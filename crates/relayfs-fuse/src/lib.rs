//! relayfs: a FUSE bridge that hands kernel requests to an asynchronous
//! handler and routes each handler reply back to the kernel request that
//! asked for it.
//!
//! The kernel side ([`filesystem`], [`dispatch`]) never blocks on the
//! handler. The handler side ([`handler`], [`resolve`]) answers by
//! correlation id, in any order, from any thread.

pub mod attr;
pub mod codec;
pub mod config;
pub mod dirbuf;
pub mod dispatch;
pub mod error;
pub mod filesystem;
pub mod handle;
pub mod handler;
pub mod mount;
pub mod op;
pub mod registry;
pub mod reply;
pub mod resolve;
pub mod session;
pub mod stats;
pub mod wire;

pub use attr::{CanonicalAttr, PlatformAttr};
pub use config::BridgeConfig;
pub use dispatch::{Dispatcher, HandlerMessage, LifecycleAck};
pub use error::{BridgeError, Result};
pub use handle::{FnHandle, KernelHandle};
pub use handler::{serve, HandlerInbox, OpHandler};
pub use op::{Caller, OpKind, OpParams};
pub use registry::RequestId;
pub use reply::{Completion, DirEntryReply, Reply};
pub use resolve::{Resolution, Resolver};
pub use session::{BridgeSession, MountedSession};
