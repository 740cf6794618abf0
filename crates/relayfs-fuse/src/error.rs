use std::fmt;
use thiserror::Error;

/// Why a request could not be handed to the handler context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffFailure {
    /// The handoff channel is at capacity.
    Full,
    /// The handler side of the channel has been dropped.
    Closed,
}

impl fmt::Display for HandoffFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffFailure::Full => f.write_str("channel full"),
            HandoffFailure::Closed => f.write_str("channel closed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mount failed at {mountpoint}: {reason}")]
    MountFailed { mountpoint: String, reason: String },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("Handoff of request {id} rejected: {reason}")]
    HandoffRejected { id: u64, reason: HandoffFailure },

    #[error("Handler context is gone")]
    HandlerGone,

    #[error("Malformed {kind} reply: {reason}")]
    MalformedReply { kind: &'static str, reason: String },

    #[error("Attribute field out of range: {field}")]
    AttrOutOfRange { field: &'static str },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub(crate) fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        BridgeError::MalformedReply {
            kind,
            reason: reason.into(),
        }
    }

    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            BridgeError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            BridgeError::MountFailed { .. } => ENOENT,
            BridgeError::InvalidArgument { .. } => EINVAL,
            BridgeError::HandoffRejected { .. } => EIO,
            BridgeError::HandlerGone => EIO,
            BridgeError::MalformedReply { .. } => EIO,
            BridgeError::AttrOutOfRange { .. } => EOVERFLOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_rejected_errno() {
        let err = BridgeError::HandoffRejected {
            id: 7,
            reason: HandoffFailure::Full,
        };
        assert_eq!(err.to_errno(), libc::EIO);
        assert_eq!(
            err.to_string(),
            "Handoff of request 7 rejected: channel full"
        );
    }

    #[test]
    fn test_malformed_reply_errno() {
        let err = BridgeError::malformed("getattr", "missing attributes");
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.to_string().contains("getattr"));
    }

    #[test]
    fn test_attr_out_of_range_errno() {
        let err = BridgeError::AttrOutOfRange { field: "nlink" };
        assert_eq!(err.to_errno(), libc::EOVERFLOW);
    }

    #[test]
    fn test_invalid_argument_errno() {
        let err = BridgeError::InvalidArgument {
            msg: "channel capacity must be nonzero".into(),
        };
        assert_eq!(err.to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_io_error_keeps_os_errno() {
        let err = BridgeError::Io(std::io::Error::from_raw_os_error(libc::ENOTCONN));
        assert_eq!(err.to_errno(), libc::ENOTCONN);
    }

    #[test]
    fn test_io_error_without_os_errno_is_eio() {
        let err = BridgeError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_errno(), libc::EIO);
    }
}
