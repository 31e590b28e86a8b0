//! Error types for forkpoint operations.

use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during forkpoint operations.
#[derive(Error, Debug)]
pub enum ForkpointError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// The operation is not supported by this kind of stream.
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// An argument was rejected at the call boundary.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested hash algorithm is unknown.
    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The remote side answered a request with a failure.
    #[error("Client error [{correlation_id}]: {message}")]
    Client {
        /// Correlation id of the failed request.
        correlation_id: Uuid,
        /// Human readable failure description.
        message: String,
        /// Raw bytes of the failed response frame payload.
        response: Vec<u8>,
    },

    /// Malformed frame or unexpected message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Two digest sets cannot be compared.
    #[error("Digest set mismatch: expected {expected} entries, got {actual}")]
    DigestMismatch {
        /// Expected number of entries
        expected: usize,
        /// Number of entries received
        actual: usize,
    },
}

impl ForkpointError {
    /// Whether this error is the cancellation outcome.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Convert into an `io::Error` for use behind `Read`/`Write` impls.
    ///
    /// The conversion is reversible: `ForkpointError::from` recovers
    /// `Cancelled` from the returned error.
    #[must_use]
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io(err) => err,
            Self::NotSupported(_) => io::Error::new(io::ErrorKind::Unsupported, self),
            Self::InvalidArgument(_) => io::Error::new(io::ErrorKind::InvalidInput, self),
            other => io::Error::other(other),
        }
    }
}

impl From<io::Error> for ForkpointError {
    fn from(err: io::Error) -> Self {
        let cancelled = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<Self>())
            .is_some_and(Self::is_cancelled);
        if cancelled {
            Self::Cancelled
        } else {
            Self::Io(err)
        }
    }
}

/// Result type for forkpoint operations.
pub type Result<T> = std::result::Result<T, ForkpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = ForkpointError::from(io_err);
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_display_not_supported() {
        let err = ForkpointError::NotSupported("seek on a tap");
        assert!(err.to_string().contains("not supported"));
        assert!(err.to_string().contains("seek on a tap"));
    }

    #[test]
    fn error_display_invalid_argument() {
        let err = ForkpointError::InvalidArgument("part_count must be >= 2".to_string());
        assert!(err.to_string().contains("Invalid argument"));
    }

    #[test]
    fn error_display_client() {
        let id = Uuid::new_v4();
        let err = ForkpointError::Client {
            correlation_id: id,
            message: "target unavailable".to_string(),
            response: vec![1, 2, 3],
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("target unavailable"));
    }

    #[test]
    fn error_display_digest_mismatch() {
        let err = ForkpointError::DigestMismatch {
            expected: 6,
            actual: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 6"));
        assert!(msg.contains("got 3"));
    }

    #[test]
    fn cancelled_survives_io_round_trip() {
        let io_err = ForkpointError::Cancelled.into_io();
        let back = ForkpointError::from(io_err);
        assert!(back.is_cancelled());
    }

    #[test]
    fn not_supported_maps_to_unsupported_kind() {
        let io_err = ForkpointError::NotSupported("write").into_io();
        assert_eq!(io_err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn plain_io_error_stays_io() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err = ForkpointError::from(io_err);
        assert!(matches!(err, ForkpointError::Io(_)));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn result_type_err() {
        let result: Result<i32> = Err(ForkpointError::Cancelled);
        assert!(result.is_err());
    }
}
