//! The transport capability boundary.
//!
//! The engine never talks to the USB stack directly; it drives an
//! implementation of [`Transport`]. The production implementation (libusb
//! via `rusb`) lives in the `transport` crate; tests and examples use
//! [`MockTransport`](crate::test_utils::MockTransport).

use crate::error::TransportError;
use crate::hotplug::HotplugEvent;
use crate::identity::DeviceIdentity;
use async_channel::Sender;
use std::time::Duration;

/// An open device as produced by [`Transport::open`].
///
/// Exclusively owned by the session that opened it; the engine never
/// duplicates the record or the handle inside it.
#[derive(Debug)]
pub struct OpenedDevice<H> {
    /// Transport-private per-device state.
    pub handle: H,
    /// The actual identity read from the descriptor, never a wildcard.
    pub identity: DeviceIdentity,
    /// Largest number of bytes a single write call may carry.
    pub max_packet_size: usize,
}

impl<H> OpenedDevice<H> {
    /// Builds a record, clamping `max_packet_size` to at least one byte.
    pub fn new(handle: H, identity: DeviceIdentity, max_packet_size: usize) -> Self {
        Self {
            handle,
            identity,
            max_packet_size: max_packet_size.max(1),
        }
    }
}

/// Blocking USB primitives consumed by the engine.
///
/// One transport value serves both a session and a monitor, so
/// implementations should be cheap to clone. Calls block the calling
/// thread; the engine serializes access to an [`OpenedDevice`] itself, so
/// implementations only need to keep their own shared state consistent.
pub trait Transport: Send + Sync {
    /// Per-device state carried inside [`OpenedDevice`].
    type Handle: Send;

    /// Keeps a hotplug subscription alive; dropping it unsubscribes.
    type Subscription: Send;

    /// Enumerates attached devices and opens the first one matching
    /// `filter` (zero fields match any value).
    ///
    /// `Ok(None)` means nothing matched, a normal outcome rather than an
    /// error. Failing to open or prepare a matched device is an `Err`.
    fn open(
        &self,
        filter: DeviceIdentity,
    ) -> Result<Option<OpenedDevice<Self::Handle>>, TransportError>;

    /// Closes an open device, releasing whatever `open` acquired. The
    /// device is consumed either way; an error is purely informational.
    fn close(&self, device: OpenedDevice<Self::Handle>) -> Result<(), TransportError>;

    /// Writes `bytes` as a single unit and returns how many were
    /// accepted. Bounded by the transport's own configured write timeout.
    fn write(
        &self,
        device: &mut OpenedDevice<Self::Handle>,
        bytes: &[u8],
    ) -> Result<usize, TransportError>;

    /// Performs one blocking read bounded by `timeout`.
    ///
    /// A timeout may surface as [`TransportError::Timeout`] or as an
    /// empty buffer; the engine treats both as "no response".
    fn read(
        &self,
        device: &mut OpenedDevice<Self::Handle>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Subscribes to arrival/removal notifications.
    ///
    /// Every observed event goes into `events` unfiltered (identity
    /// filtering is the monitor's job) and sending must not block the
    /// transport's notification thread. Dropping the returned
    /// subscription unsubscribes and closes the sender side.
    fn subscribe_hotplug(
        &self,
        events: Sender<HotplugEvent>,
    ) -> Result<Self::Subscription, TransportError>;
}
