//! # Microbus Core
//!
//! Core types shared by every crate of the Microbus fabric.
//!
//! This crate provides the foundational types used throughout Microbus:
//!
//! - [`MicrobusError`] - Fabric-wide error with status code and traced stack
//! - [`Frame`] / [`FrameMut`] - Control headers carried by every bus message
//! - [`Context`] - Deadline, cancellation, frame and trace context of a call
//! - [`Handler`] - The request handler trait
//! - [`Deployment`] - Environment label gating debug behaviors
//! - [`ShutdownSignal`] - Cloneable cancellation signal

#![doc(html_root_url = "https://docs.rs/microbus-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod context;
mod deployment;
mod error;
pub mod frame;
mod handler;
pub mod ids;
mod message;
mod shutdown;

pub use context::Context;
pub use deployment::{Deployment, ParseDeploymentError};
pub use error::{ErrorEnvelope, ErrorKind, MicrobusError, MicrobusResult, StackFrame};
pub use frame::{Frame, FrameMut, OpCode};
pub use handler::{BoxFuture, Handler, SharedHandler};
pub use message::{PathArgs, Request, RequestExt, Response, ResponseExt};
pub use shutdown::{wait_for_os_signal, InFlightToken, InFlightTracker, ShutdownReceiver, ShutdownSignal};

/// Reserved internal port for control endpoints.
pub const CONTROL_PORT: u16 = 888;

/// Default internal port when a URL names none.
pub const DEFAULT_PORT: u16 = 443;
