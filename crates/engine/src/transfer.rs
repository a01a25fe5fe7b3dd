//! Chunked transfers and progress accounting.
//!
//! Payloads are split into chunks no larger than the transport's maximum
//! packet size and written sequentially under the session's serialization
//! lock; the progress counter is updated after every chunk so other
//! threads can poll it mid-transfer. The write loop checks the session's
//! cancel flag between chunks, which is how a concurrent `disconnect`
//! reclaims the device within one chunk-write of asking.

use crate::error::{EngineError, Result, TransportError};
use crate::session::DeviceSession;
use crate::transport::{OpenedDevice, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Cumulative bytes-sent counter for the current transfer request.
///
/// Reset to zero when a request starts and only added to afterwards, so a
/// reader sampling during one request observes a non-decreasing value.
/// Reads never block and never fail.
#[derive(Debug, Default)]
pub struct TransferProgress {
    bytes: AtomicU64,
}

impl TransferProgress {
    pub(crate) fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes sent so far in the current (or last) request.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl<T: Transport> DeviceSession<T> {
    /// Fire-and-forget transfer: writes `payload` in packet-sized chunks
    /// and returns the total number of bytes written.
    ///
    /// Empty payloads fail with [`EngineError::EmptyPayload`] before any
    /// lock or transport call. Requires a connected session
    /// ([`EngineError::NotConnected`] otherwise). A short chunk write is
    /// fatal for the call ([`EngineError::ShortWrite`]); nothing is
    /// retried. A concurrent disconnect aborts the call with
    /// [`EngineError::Cancelled`].
    pub fn send(&self, payload: &[u8]) -> Result<usize> {
        if payload.is_empty() {
            return Err(EngineError::EmptyPayload);
        }
        let mut link = self.lock_link();
        let device = link.as_mut().ok_or(EngineError::NotConnected)?;
        self.write_chunked(device, payload)
    }

    /// Request/response transfer: performs the same chunked write as
    /// [`send`](Self::send), then one blocking read bounded by `timeout`,
    /// returning the response bytes.
    ///
    /// No response within `timeout` (transport timeout or an empty read)
    /// fails with [`EngineError::ResponseTimeout`] and leaves the session
    /// connected. The read is issued exactly once; re-issuing is the
    /// caller's decision.
    pub fn send_with_response(&self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Err(EngineError::EmptyPayload);
        }
        let mut link = self.lock_link();
        let device = link.as_mut().ok_or(EngineError::NotConnected)?;
        self.write_chunked(device, payload)?;

        match self.transport().read(device, timeout) {
            Ok(bytes) if bytes.is_empty() => Err(EngineError::ResponseTimeout { timeout }),
            Ok(bytes) => {
                trace!("Received {} response bytes", bytes.len());
                Ok(bytes)
            }
            Err(TransportError::Timeout) => Err(EngineError::ResponseTimeout { timeout }),
            Err(e) => Err(EngineError::Transfer(e)),
        }
    }

    /// Bytes sent by the current (or last) transfer request. Never blocks,
    /// never fails; zero before the first request.
    pub fn progress(&self) -> u64 {
        self.progress_counter().bytes_sent()
    }

    fn write_chunked(
        &self,
        device: &mut OpenedDevice<T::Handle>,
        payload: &[u8],
    ) -> Result<usize> {
        self.progress_counter().reset();
        let chunk_size = device.max_packet_size;
        let mut total = 0usize;

        for chunk in payload.chunks(chunk_size) {
            if self.cancel_requested() {
                debug!("Transfer cancelled after {total} of {} bytes", payload.len());
                return Err(EngineError::Cancelled);
            }
            let written = self
                .transport()
                .write(device, chunk)
                .map_err(EngineError::Transfer)?;
            if written != chunk.len() {
                self.progress_counter().add(written as u64);
                return Err(EngineError::ShortWrite {
                    expected: chunk.len(),
                    written,
                });
            }
            total += written;
            self.progress_counter().add(written as u64);
        }

        trace!(
            "Wrote {total} bytes in {} chunks of at most {chunk_size}",
            payload.len().div_ceil(chunk_size)
        );
        Ok(total)
    }
}


/// Property-based checks of the chunk arithmetic.
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::test_utils::MockTransport;
    use proptest::prelude::*;

    fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 1..=2048)
    }

    proptest! {
        /// Every chunk respects the packet size, the bytes arrive in
        /// order, and the final progress equals the payload length.
        #[test]
        fn prop_chunking_preserves_payload(
            payload in payload_strategy(),
            packet_size in 1usize..=256,
        ) {
            let identity = DeviceIdentity::new(0x0483, 0x5750);
            let transport = MockTransport::with_device(identity);
            transport.set_max_packet_size(packet_size);
            let session = DeviceSession::new(transport.clone());
            prop_assert_eq!(session.connect(identity), Ok(true));

            prop_assert_eq!(session.send(&payload), Ok(payload.len()));
            prop_assert!(transport.writes().iter().all(|w| w.data.len() <= packet_size));
            prop_assert_eq!(transport.written_bytes(), payload.clone());
            prop_assert_eq!(session.progress(), payload.len() as u64);
            prop_assert_eq!(
                transport.writes().len(),
                payload.len().div_ceil(packet_size)
            );
        }
    }
}
