//! Scriptable transport for tests and examples.
//!
//! [`MockTransport`] implements the full [`Transport`] contract without
//! hardware: a table of "attached" devices for `open`, a chunk log with
//! timestamps for write assertions, scripted read replies and failures,
//! injectable hotplug events, and per-write delays for exercising
//! cancellation races. Clones share state, so tests keep one handle for
//! scripting while the engine drives another.

use crate::error::TransportError;
use crate::hotplug::HotplugEvent;
use crate::identity::DeviceIdentity;
use crate::transport::{OpenedDevice, Transport};
use async_channel::Sender;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// One recorded chunk write.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    /// Bytes handed to the transport.
    pub data: Vec<u8>,
    /// When the write was issued.
    pub at: Instant,
}

#[derive(Debug, Default)]
struct MockState {
    attached: Vec<DeviceIdentity>,
    max_packet_size: usize,
    writes: Vec<WriteRecord>,
    reads: VecDeque<Result<Vec<u8>, TransportError>>,
    write_delay: Option<Duration>,
    write_failure: Option<(usize, TransportError)>,
    short_write: Option<(usize, usize)>,
    open_failure: Option<TransportError>,
    close_failure: Option<TransportError>,
    subscribe_failure: Option<TransportError>,
    opens: usize,
    closes: usize,
    hotplug: Option<Sender<HotplugEvent>>,
}

/// Handle type produced by [`MockTransport::open`].
#[derive(Debug)]
pub struct MockHandle {
    /// Identity the handle was opened against.
    pub identity: DeviceIdentity,
}

/// Keeps mock hotplug delivery alive; dropping it detaches the sender,
/// closing the event channel like a real unsubscribe would.
pub struct MockSubscription {
    state: Arc<Mutex<MockState>>,
}

impl Drop for MockSubscription {
    fn drop(&mut self) {
        self.state.lock().unwrap().hotplug = None;
    }
}

/// Shared, cloneable in-memory [`Transport`].
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Mock with no attached devices and a 64-byte packet size.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                max_packet_size: 64,
                ..MockState::default()
            })),
        }
    }

    /// Mock with a single attached device, the common case.
    pub fn with_device(identity: DeviceIdentity) -> Self {
        let mock = Self::new();
        mock.attach(identity);
        mock
    }

    /// Adds a device to the attached table consulted by `open`.
    pub fn attach(&self, identity: DeviceIdentity) {
        self.state.lock().unwrap().attached.push(identity);
    }

    /// Sets the packet size advertised to the engine (default 64).
    pub fn set_max_packet_size(&self, size: usize) {
        self.state.lock().unwrap().max_packet_size = size;
    }

    /// Makes every write sleep for `delay` before returning, after being
    /// recorded. Lets tests catch a transfer mid-flight deterministically.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = Some(delay);
    }

    /// Fails the write with the given zero-based index across the mock's
    /// lifetime.
    pub fn fail_write(&self, index: usize, error: TransportError) {
        self.state.lock().unwrap().write_failure = Some((index, error));
    }

    /// Makes the write with the given zero-based index accept only
    /// `accepted` bytes.
    pub fn short_write(&self, index: usize, accepted: usize) {
        self.state.lock().unwrap().short_write = Some((index, accepted));
    }

    /// Makes the next `open` attempt fail.
    pub fn fail_open(&self, error: TransportError) {
        self.state.lock().unwrap().open_failure = Some(error);
    }

    /// Makes `close` report an error (the device still counts as closed).
    pub fn fail_close(&self, error: TransportError) {
        self.state.lock().unwrap().close_failure = Some(error);
    }

    /// Makes `subscribe_hotplug` fail.
    pub fn fail_subscribe(&self, error: TransportError) {
        self.state.lock().unwrap().subscribe_failure = Some(error);
    }

    /// Queues a successful read reply.
    pub fn push_read(&self, reply: &[u8]) {
        self.state.lock().unwrap().reads.push_back(Ok(reply.to_vec()));
    }

    /// Queues a failing read. Reads beyond the queue report
    /// [`TransportError::Timeout`].
    pub fn push_read_failure(&self, error: TransportError) {
        self.state.lock().unwrap().reads.push_back(Err(error));
    }

    /// Injects a hotplug event as if the platform had reported it.
    ///
    /// # Panics
    ///
    /// Panics when no subscription is active; subscribe first.
    pub fn emit(&self, event: HotplugEvent) {
        let state = self.state.lock().unwrap();
        let sender = state
            .hotplug
            .as_ref()
            .expect("no active hotplug subscription");
        sender
            .send_blocking(event)
            .expect("hotplug event channel closed");
    }

    /// All chunk writes recorded so far.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Concatenation of every written byte, in order.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .flat_map(|record| record.data.iter().copied())
            .collect()
    }

    /// Devices successfully opened so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    /// Devices closed so far.
    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Whether a hotplug subscription is currently registered.
    pub fn has_subscriber(&self) -> bool {
        self.state.lock().unwrap().hotplug.is_some()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;
    type Subscription = MockSubscription;

    fn open(
        &self,
        filter: DeviceIdentity,
    ) -> Result<Option<OpenedDevice<MockHandle>>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.open_failure.take() {
            return Err(error);
        }
        let Some(identity) = state.attached.iter().copied().find(|d| filter.matches(*d)) else {
            return Ok(None);
        };
        state.opens += 1;
        let max_packet_size = state.max_packet_size;
        Ok(Some(OpenedDevice::new(
            MockHandle { identity },
            identity,
            max_packet_size,
        )))
    }

    fn close(&self, device: OpenedDevice<MockHandle>) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        drop(device);
        match state.close_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn write(
        &self,
        _device: &mut OpenedDevice<MockHandle>,
        bytes: &[u8],
    ) -> Result<usize, TransportError> {
        let (delay, outcome) = {
            let mut state = self.state.lock().unwrap();
            let index = state.writes.len();
            state.writes.push(WriteRecord {
                data: bytes.to_vec(),
                at: Instant::now(),
            });
            let outcome = match (&state.write_failure, &state.short_write) {
                (Some((at, error)), _) if *at == index => Err(error.clone()),
                (_, Some((at, accepted))) if *at == index => Ok((*accepted).min(bytes.len())),
                _ => Ok(bytes.len()),
            };
            (state.write_delay, outcome)
        };
        // Sleep outside the lock so scripting and assertions stay
        // responsive while a slow transfer is in flight.
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        outcome
    }

    fn read(
        &self,
        _device: &mut OpenedDevice<MockHandle>,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.state
            .lock()
            .unwrap()
            .reads
            .pop_front()
            .unwrap_or(Err(TransportError::Timeout))
    }

    fn subscribe_hotplug(
        &self,
        events: Sender<HotplugEvent>,
    ) -> Result<MockSubscription, TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.subscribe_failure.take() {
            return Err(error);
        }
        if state.hotplug.is_some() {
            return Err(TransportError::Busy);
        }
        state.hotplug = Some(events);
        Ok(MockSubscription {
            state: Arc::clone(&self.state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_honors_wildcard_filters() {
        let mock = MockTransport::with_device(DeviceIdentity::new(0x0483, 0x5448));

        let device = mock
            .open(DeviceIdentity::new(0x0483, 0))
            .expect("open")
            .expect("match");
        assert_eq!(device.identity, DeviceIdentity::new(0x0483, 0x5448));
        assert_eq!(device.max_packet_size, 64);

        let no_match = mock.open(DeviceIdentity::new(0x1234, 0)).expect("open");
        assert!(no_match.is_none());
    }

    #[test]
    fn reads_are_scripted_in_order_then_time_out() {
        let mock = MockTransport::with_device(DeviceIdentity::ANY);
        let mut device = mock.open(DeviceIdentity::ANY).unwrap().unwrap();

        mock.push_read(b"first");
        mock.push_read_failure(TransportError::Pipe);

        assert_eq!(
            mock.read(&mut device, Duration::from_millis(1)),
            Ok(b"first".to_vec())
        );
        assert_eq!(
            mock.read(&mut device, Duration::from_millis(1)),
            Err(TransportError::Pipe)
        );
        assert_eq!(
            mock.read(&mut device, Duration::from_millis(1)),
            Err(TransportError::Timeout)
        );
    }

    #[test]
    fn dropping_the_subscription_detaches_the_sender() {
        let mock = MockTransport::new();
        let (tx, rx) = async_channel::unbounded();
        let subscription = mock.subscribe_hotplug(tx).expect("subscribe");
        assert!(mock.has_subscriber());

        drop(subscription);
        assert!(!mock.has_subscriber());
        assert!(rx.recv_blocking().is_err());
    }
}
