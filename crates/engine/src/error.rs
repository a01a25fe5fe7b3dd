//! Error taxonomy for the engine.
//!
//! Two layers: [`TransportError`] is what a transport implementation
//! reports, [`EngineError`] is what engine operations return. State
//! machine misuse (`AlreadyConnected`, `NotConnected`, `AlreadyMonitoring`,
//! `EmptyPayload`) is detected before any transport call; transport
//! failures are wrapped per operation and never retried inside the engine.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a transport implementation.
///
/// The variant set mirrors what libusb can report so the production
/// transport maps one-to-one; mocks pick whichever variant the test needs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The operation did not complete within its timeout.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint stalled.
    #[error("endpoint stalled")]
    Pipe,

    /// The device disappeared mid-operation.
    #[error("device no longer present")]
    NoDevice,

    /// No such device, interface, or endpoint.
    #[error("device or endpoint not found")]
    NotFound,

    /// The device or interface is held by another program.
    #[error("device busy")]
    Busy,

    /// Insufficient permissions to open or claim the device.
    #[error("access denied")]
    Access,

    /// Low-level I/O failure.
    #[error("transport I/O error")]
    Io,

    /// The transport rejected a parameter.
    #[error("invalid transport parameter")]
    InvalidParam,

    /// Anything the transport cannot classify further.
    #[error("{message}")]
    Other { message: String },
}

/// Errors returned by session, transfer, monitor, and command operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// `connect` was called while a session is already established or in
    /// transition.
    #[error("a device session is already established")]
    AlreadyConnected,

    /// A transfer was requested without a connected session.
    #[error("no device session established")]
    NotConnected,

    /// The transport failed while opening a matched device.
    #[error("failed to open device")]
    Connection(#[source] TransportError),

    /// The transport failed during a write or read.
    #[error("transfer failed")]
    Transfer(#[source] TransportError),

    /// A chunk write accepted fewer bytes than it was given. Partial
    /// progress is not retried; the caller decides whether to re-send.
    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { expected: usize, written: usize },

    /// No response bytes arrived within the caller's bound.
    #[error("no response within {timeout:?}")]
    ResponseTimeout { timeout: Duration },

    /// `start` was called while the monitor is already active.
    #[error("hotplug monitor already active")]
    AlreadyMonitoring,

    /// The transport refused the hotplug subscription.
    #[error("hotplug subscription failed")]
    Subscription(#[source] TransportError),

    /// The transfer was aborted by a concurrent disconnect.
    #[error("transfer cancelled by disconnect")]
    Cancelled,

    /// A zero-length payload was rejected before reaching the transport.
    #[error("payload must not be empty")]
    EmptyPayload,
}

/// Convenience alias for engine operation results.
pub type Result<T> = std::result::Result<T, EngineError>;
