//! Error types for Microbus.
//!
//! This module provides the [`MicrobusError`] type, which is the standard error
//! type carried across the fabric. An error raised by a handler on one
//! microservice is serialized into the reply frame and reconstituted by the
//! caller with the same status code.
//!
//! # Error kinds
//!
//! | `ErrorKind` | Status |
//! |---|---|
//! | `BadInput` | 400 |
//! | `Unauthenticated` | 401 |
//! | `Forbidden` | 403 |
//! | `NotFound` | 404 |
//! | `RequestTooLarge` | 413 |
//! | `Internal` | 500 |
//! | `Timeout` | 504 |
//! | `NoResponders` | 404 |
//! | `ConfigInvalid` | 500 |
//! | `LoopDetected` | 508 |
//!
//! # Stack
//!
//! Every error records the source location where it was created, and
//! [`MicrobusError::trace`] appends the location of each propagation point.
//! The stack travels over the bus only in `LOCAL` and `TESTING` deployments.

use std::fmt;
use std::panic::Location;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using [`MicrobusError`].
pub type MicrobusResult<T> = Result<T, MicrobusError>;

/// Classification of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid input from the caller.
    BadInput,
    /// Missing or invalid credentials.
    Unauthenticated,
    /// Caller is not permitted.
    Forbidden,
    /// Resource or endpoint not found.
    NotFound,
    /// Request body exceeds an admission limit.
    RequestTooLarge,
    /// A deadline elapsed.
    Timeout,
    /// Unexpected failure, including panics.
    Internal,
    /// No microservice acknowledged the request.
    NoResponders,
    /// A configuration value failed validation.
    ConfigInvalid,
    /// The call depth exceeded its limit.
    LoopDetected,
}

impl ErrorKind {
    /// Returns the default HTTP status code for this error kind.
    #[must_use]
    pub const fn default_status_code(&self) -> StatusCode {
        match self {
            Self::BadInput => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound | Self::NoResponders => StatusCode::NOT_FOUND,
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal | Self::ConfigInvalid => StatusCode::INTERNAL_SERVER_ERROR,
            Self::LoopDetected => StatusCode::LOOP_DETECTED,
        }
    }

    /// Infers the kind of an error from a status code received over the wire.
    #[must_use]
    pub fn from_status_code(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_REQUEST => Self::BadInput,
            StatusCode::UNAUTHORIZED => Self::Unauthenticated,
            StatusCode::FORBIDDEN => Self::Forbidden,
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::PAYLOAD_TOO_LARGE => Self::RequestTooLarge,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Self::Timeout,
            StatusCode::LOOP_DETECTED => Self::LoopDetected,
            s if s.is_client_error() => Self::BadInput,
            _ => Self::Internal,
        }
    }
}

/// A source location recorded on an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Source file.
    pub file: String,
    /// Line number.
    pub line: u32,
}

impl StackFrame {
    fn caller(location: &Location<'_>) -> Self {
        Self {
            file: location.file().to_string(),
            line: location.line(),
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Standard error type for Microbus.
///
/// # Example
///
/// ```
/// use microbus_core::{MicrobusError, ErrorKind};
///
/// fn validate(name: &str) -> Result<(), MicrobusError> {
///     if name.is_empty() {
///         return Err(MicrobusError::bad_input("name is required"));
///     }
///     Ok(())
/// }
///
/// let err = validate("").unwrap_err();
/// assert_eq!(err.kind(), ErrorKind::BadInput);
/// assert_eq!(err.status_code().as_u16(), 400);
/// ```
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct MicrobusError {
    kind: ErrorKind,
    status: StatusCode,
    message: String,
    stack: Vec<StackFrame>,
}

impl MicrobusError {
    /// Creates an error of the given kind with its default status code.
    #[must_use]
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: kind.default_status_code(),
            message: message.into(),
            stack: vec![StackFrame::caller(Location::caller())],
        }
    }

    /// Creates an error with an explicit status code.
    #[must_use]
    #[track_caller]
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status_code(status),
            status,
            message: message.into(),
            stack: vec![StackFrame::caller(Location::caller())],
        }
    }

    /// Creates a bad input error.
    #[must_use]
    #[track_caller]
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadInput, message)
    }

    /// Creates an unauthenticated error.
    #[must_use]
    #[track_caller]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    /// Creates a forbidden error.
    #[must_use]
    #[track_caller]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Creates a not found error.
    #[must_use]
    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Creates a request too large error.
    #[must_use]
    #[track_caller]
    pub fn request_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RequestTooLarge, message)
    }

    /// Creates a timeout error.
    #[must_use]
    #[track_caller]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Creates an internal error.
    #[must_use]
    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Creates an internal error that wraps the display of a source error.
    #[must_use]
    #[track_caller]
    pub fn internal_with_source(message: impl Into<String>, source: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, format!("{}: {source}", message.into()))
    }

    /// Creates a no responders error.
    #[must_use]
    #[track_caller]
    pub fn no_responders(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoResponders, message)
    }

    /// Creates a configuration validation error.
    #[must_use]
    #[track_caller]
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    /// Creates a loop detected error.
    #[must_use]
    #[track_caller]
    pub fn loop_detected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LoopDetected, message)
    }

    /// Appends the caller's location to the stack.
    ///
    /// Call at each propagation point: `.map_err(MicrobusError::trace)?`.
    #[must_use]
    #[track_caller]
    pub fn trace(mut self) -> Self {
        self.stack.push(StackFrame::caller(Location::caller()));
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the HTTP status code.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the recorded stack, oldest frame first.
    #[must_use]
    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    /// Converts this error to its serializable envelope.
    #[must_use]
    pub fn to_envelope(&self, include_stack: bool) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.message.clone(),
            status_code: self.status.as_u16(),
            stack: include_stack.then(|| self.stack.iter().map(ToString::to_string).collect()),
        }
    }

    /// Serializes the envelope to JSON bytes.
    #[must_use]
    pub fn to_json(&self, include_stack: bool) -> Vec<u8> {
        serde_json::to_vec(&self.to_envelope(include_stack))
            .unwrap_or_else(|_| br#"{"error":"internal error","statusCode":500}"#.to_vec())
    }

    /// Reconstitutes an error from a JSON envelope received over the bus.
    ///
    /// A body that is not an envelope becomes the message of an internal error.
    #[must_use]
    #[track_caller]
    pub fn from_envelope(body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(envelope) => {
                let status = StatusCode::from_u16(envelope.status_code)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut stack: Vec<StackFrame> = envelope
                    .stack
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|s| parse_frame(s))
                    .collect();
                stack.push(StackFrame::caller(Location::caller()));
                Self {
                    kind: ErrorKind::from_status_code(status),
                    status,
                    message: envelope.error,
                    stack,
                }
            }
            Err(_) => Self::internal(String::from_utf8_lossy(body).into_owned()),
        }
    }
}

fn parse_frame(s: &str) -> Option<StackFrame> {
    let (file, line) = s.rsplit_once(':')?;
    Some(StackFrame {
        file: file.to_string(),
        line: line.parse().ok()?,
    })
}

impl From<anyhow::Error> for MicrobusError {
    #[track_caller]
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for MicrobusError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::bad_input(err.to_string())
    }
}

impl From<std::io::Error> for MicrobusError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

/// Serializable error body carried in replies with `Op-Code: Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// Human-readable error message.
    pub error: String,
    /// HTTP status code.
    pub status_code: u16,
    /// Source locations, oldest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
}
