//! Transport errors.

use microbus_core::MicrobusError;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors of the codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The payload ended before the message did.
    #[error("incomplete message")]
    Incomplete,
    /// The leading kind byte is unknown.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    /// A field does not fit its length prefix.
    #[error("field too large")]
    FieldTooLarge,
    /// A method, URI, status or header is not valid HTTP.
    #[error("invalid {0}")]
    Invalid(&'static str),
}

/// Errors of fragment reassembly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    /// The integrated message would exceed the size cap.
    #[error("message of at least {size} bytes exceeds the limit of {max} bytes")]
    TooLarge {
        /// Bytes received so far
        size: usize,
        /// Configured cap
        max: usize,
    },
    /// A fragment disagrees with the count of the first one seen.
    #[error("fragment {index}/{count} does not belong to a message of {expected} fragments")]
    Mismatch {
        /// Fragment index
        index: u32,
        /// Fragment count claimed by this fragment
        count: u32,
        /// Fragment count of the message
        expected: u32,
    },
    /// No fragment arrived within the inactivity timeout.
    #[error("timed out waiting for fragments")]
    Timeout,
}

/// Errors raised by a [`Transport`](crate::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connecting to the bus failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Bus URL
        url: String,
        /// Underlying failure
        reason: String,
    },
    /// Publishing failed.
    #[error("failed to publish to {subject}: {reason}")]
    Publish {
        /// Subject
        subject: String,
        /// Underlying failure
        reason: String,
    },
    /// Subscribing failed.
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe {
        /// Subject
        subject: String,
        /// Underlying failure
        reason: String,
    },
    /// The transport was closed.
    #[error("transport is closed")]
    Closed,
    /// Encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Reassembly failed.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

impl TransportError {
    /// Creates a publish error.
    pub fn publish(subject: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            subject: subject.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a subscribe error.
    pub fn subscribe(subject: impl Into<String>, reason: impl ToString) -> Self {
        Self::Subscribe {
            subject: subject.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<TransportError> for MicrobusError {
    #[track_caller]
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Fragment(FragmentError::TooLarge { .. }) => {
                Self::request_too_large(err.to_string())
            }
            TransportError::Fragment(FragmentError::Timeout) => Self::timeout(err.to_string()),
            TransportError::Codec(_) | TransportError::Fragment(_) => {
                Self::bad_input(err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}
