//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.
//!
//! Every variant maps onto exactly one [`ErrorCode`], the machine-checkable
//! kind a caller branches on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-checkable classification of a [`CsiError`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed or semantically inconsistent request.
    InvalidArgument,
    /// A name collision with incompatible size or provenance.
    AlreadyExists,
    /// A referenced volume or snapshot does not exist.
    NotFound,
    /// Requested size exceeds the configured maximum.
    OutOfRange,
    /// No capacity pool can satisfy the request.
    ResourceExhausted,
    /// The plugin is not configured to answer.
    Unavailable,
    /// Filesystem, device or tool failure.
    Internal,
    /// QUIC or wire-level failure.
    Transport,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An object with the same name exists but is incompatible.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The referenced object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested size is larger than allowed.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Not enough capacity left.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The plugin cannot serve the request in its current configuration.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A filesystem operation failed.
    #[error("{op} {path}: {reason}")]
    Io {
        /// Operation that failed, e.g. `"create dir"`.
        op: String,
        /// Path the operation was applied to.
        path: String,
        /// Underlying cause.
        reason: String,
    },

    /// An external tool exited unsuccessfully or could not be spawned.
    #[error("command `{command}` failed: {reason}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit status and captured output.
        reason: String,
    },

    /// Loop device attach or detach failed.
    #[error("loop device for {path}: {reason}")]
    DeviceFailed {
        /// Backing file of the loop device.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Classify this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::OutOfRange(_) => ErrorCode::OutOfRange,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::Io { .. }
            | Self::CommandFailed { .. }
            | Self::DeviceFailed { .. }
            | Self::Internal(_) => ErrorCode::Internal,
            Self::TransportError(_) => ErrorCode::Transport,
        }
    }

    /// Build a [`CsiError::Io`] from an operation name, a path and a cause.
    pub fn io<E: std::fmt::Display>(op: &str, path: &std::path::Path, e: E) -> Self {
        Self::Io {
            op: op.to_owned(),
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn error_display() {
        let err = CsiError::NotFound("volume vol-123".into());
        assert_eq!(err.to_string(), "not found: volume vol-123");

        let err = CsiError::io("remove dir", Path::new("/var/lib/csi/v1"), "busy");
        assert_eq!(err.to_string(), "remove dir /var/lib/csi/v1: busy");
    }

    #[test]
    fn codes_group_physical_failures_as_internal() {
        let device = CsiError::DeviceFailed {
            path: "/tmp/v".into(),
            reason: "no free loop device".into(),
        };
        let command = CsiError::CommandFailed {
            command: "dd".into(),
            reason: "exit 1".into(),
        };
        assert_eq!(device.code(), ErrorCode::Internal);
        assert_eq!(command.code(), ErrorCode::Internal);
        assert_eq!(
            CsiError::ResourceExhausted("x".into()).code(),
            ErrorCode::ResourceExhausted
        );
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::DeviceFailed {
            path: "/var/lib/csi/vol".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
        assert_eq!(de.code(), ErrorCode::Internal);
    }
}
