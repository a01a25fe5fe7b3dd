//! Command-protocol conventions for the plotter family.
//!
//! The plotters speak short ASCII commands terminated by `;` (`RSVER;`
//! for the firmware version, `RPID;` for the product id, `USBS;` for the
//! status register) and drop or garble replies when commands arrive too
//! close together. This layer owns those conventions: minimum dispatch
//! spacing and the meaning of the status token. The transfer path below
//! it stays byte-agnostic.

use crate::error::{EngineError, Result};
use crate::session::DeviceSession;
use crate::transport::Transport;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Minimum gap between successive command dispatches.
///
/// Dispatches that would land inside the window are delayed, never
/// rejected.
pub const MIN_COMMAND_SPACING: Duration = Duration::from_millis(150);

/// Default bound for a command's response read.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Status poll understood by the plotter family.
pub const STATUS_COMMAND: &[u8] = b"USBS;";

/// Status token meaning the plotter has drained its buffer and is ready
/// for the next job.
pub const READY_TOKEN: &[u8] = b"0";

/// A raw status reply with the family's token conventions applied lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply(pub Vec<u8>);

impl StatusReply {
    /// Significant bytes of the reply: ASCII whitespace trimmed and the
    /// trailing `;` terminator stripped.
    pub fn token(&self) -> &[u8] {
        let trimmed = self.0.trim_ascii();
        let without_terminator = trimmed.strip_suffix(b";").unwrap_or(trimmed);
        without_terminator.trim_ascii_end()
    }

    /// Whether the token reads as the ready/idle code.
    pub fn is_ready(&self) -> bool {
        self.token() == READY_TOKEN
    }

    /// The reply exactly as the device sent it.
    pub fn raw(&self) -> &[u8] {
        &self.0
    }
}

/// Paced command port over a connected session.
///
/// Each logical command is one transfer; the port keeps the timestamp of
/// the last dispatch and sleeps out the remainder of the spacing window
/// before issuing the next one. The pacing lock is held across the whole
/// exchange, so concurrent dispatches serialize and spacing is measured
/// dispatch-to-dispatch.
pub struct CommandPort<'s, T: Transport> {
    session: &'s DeviceSession<T>,
    spacing: Duration,
    response_timeout: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl<'s, T: Transport> CommandPort<'s, T> {
    /// Port with the default spacing and response timeout.
    pub fn new(session: &'s DeviceSession<T>) -> Self {
        Self::with_config(session, MIN_COMMAND_SPACING, DEFAULT_RESPONSE_TIMEOUT)
    }

    /// Port with explicit spacing and response timeout.
    pub fn with_config(
        session: &'s DeviceSession<T>,
        spacing: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            session,
            spacing,
            response_timeout,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Sends one command and returns its response bytes.
    pub fn exchange(&self, command: &[u8]) -> Result<Vec<u8>> {
        let _gate = self.pace();
        self.session
            .send_with_response(command, self.response_timeout)
    }

    /// Sends one command without reading a response. Same pacing rules as
    /// [`exchange`](Self::exchange).
    pub fn send(&self, command: &[u8]) -> Result<usize> {
        let _gate = self.pace();
        self.session.send(command)
    }

    /// Queries the plotter's status register.
    pub fn query_status(&self) -> Result<StatusReply> {
        self.exchange(STATUS_COMMAND).map(StatusReply)
    }

    /// Polls the status register until it reads ready or `deadline`
    /// passes; returns whether readiness was observed.
    ///
    /// A response timeout during a poll counts as "not ready yet", since
    /// a plotter mid-job can sit on the status reply; any other failure
    /// aborts the poll. At least one poll is issued even with a
    /// zero deadline.
    pub fn wait_ready(&self, deadline: Duration) -> Result<bool> {
        let started = Instant::now();
        loop {
            match self.query_status() {
                Ok(reply) if reply.is_ready() => return Ok(true),
                Ok(reply) => trace!("Plotter busy, status token {:?}", reply.token()),
                Err(EngineError::ResponseTimeout { .. }) => trace!("Status poll timed out"),
                Err(e) => return Err(e),
            }
            if started.elapsed() >= deadline {
                return Ok(false);
            }
        }
    }

    /// Sleeps out the remainder of the spacing window, stamps this
    /// dispatch, and returns the guard that serializes the exchange.
    fn pace(&self) -> MutexGuard<'_, Option<Instant>> {
        let mut last = self.last_dispatch.lock().unwrap();
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < self.spacing {
                let delay = self.spacing - since;
                debug!("Delaying command dispatch by {delay:?}");
                thread::sleep(delay);
            }
        }
        *last = Some(Instant::now());
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::test_utils::MockTransport;

    const HWJ: DeviceIdentity = DeviceIdentity {
        vendor_id: 0x0483,
        product_id: 0x5750,
    };

    fn connected_session(transport: &MockTransport) -> DeviceSession<MockTransport> {
        let session = DeviceSession::new(transport.clone());
        assert_eq!(session.connect(HWJ), Ok(true));
        session
    }

    #[test]
    fn status_reply_tokenization() {
        assert!(StatusReply(b"0".to_vec()).is_ready());
        assert!(StatusReply(b"0;".to_vec()).is_ready());
        assert!(StatusReply(b" 0;\r\n".to_vec()).is_ready());
        assert!(!StatusReply(b"1;".to_vec()).is_ready());
        assert!(!StatusReply(b"".to_vec()).is_ready());
        assert_eq!(StatusReply(b" 30 ;\r".to_vec()).token(), b"30");
    }

    #[test]
    fn exchange_round_trips_through_the_session() {
        let transport = MockTransport::with_device(HWJ);
        transport.push_read(b"V1.3;");
        let session = connected_session(&transport);
        let port = CommandPort::with_config(
            &session,
            Duration::from_millis(1),
            Duration::from_millis(50),
        );

        assert_eq!(port.exchange(b"RSVER;"), Ok(b"V1.3;".to_vec()));
        assert_eq!(transport.writes()[0].data, b"RSVER;");
    }

    #[test]
    fn back_to_back_dispatches_respect_the_spacing() {
        let transport = MockTransport::with_device(HWJ);
        transport.push_read(b"0;");
        transport.push_read(b"0;");
        let session = connected_session(&transport);
        let spacing = Duration::from_millis(60);
        let port = CommandPort::with_config(&session, spacing, Duration::from_millis(50));

        port.exchange(b"USBS;").expect("first");
        port.exchange(b"USBS;").expect("second");

        let writes = transport.writes();
        assert_eq!(writes.len(), 2);
        let gap = writes[1].at.duration_since(writes[0].at);
        assert!(gap >= spacing, "dispatch gap {gap:?} below {spacing:?}");
    }

    #[test]
    fn first_dispatch_is_not_delayed() {
        let transport = MockTransport::with_device(HWJ);
        transport.push_read(b"0;");
        let session = connected_session(&transport);
        let port = CommandPort::with_config(&session, Duration::from_secs(5), Duration::from_millis(50));

        let started = Instant::now();
        port.exchange(b"USBS;").expect("exchange");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn fire_and_forget_commands_are_paced_too() {
        let transport = MockTransport::with_device(HWJ);
        let session = connected_session(&transport);
        let spacing = Duration::from_millis(40);
        let port = CommandPort::with_config(&session, spacing, Duration::from_millis(50));

        port.send(b"BD:36;").expect("first");
        port.send(b"BD:36;").expect("second");

        let writes = transport.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].at.duration_since(writes[0].at) >= spacing);
    }

    #[test]
    fn errors_propagate_through_the_port() {
        let transport = MockTransport::with_device(HWJ);
        let session = DeviceSession::new(transport);
        let port = CommandPort::new(&session);

        assert_eq!(port.exchange(b"USBS;"), Err(EngineError::NotConnected));
        assert_eq!(port.send(b"USBS;"), Err(EngineError::NotConnected));
    }

    #[test]
    fn wait_ready_polls_until_the_token_clears() {
        let transport = MockTransport::with_device(HWJ);
        transport.push_read(b"1;");
        transport.push_read_failure(crate::error::TransportError::Timeout);
        transport.push_read(b"0;");
        let session = connected_session(&transport);
        let port = CommandPort::with_config(
            &session,
            Duration::from_millis(1),
            Duration::from_millis(20),
        );

        assert_eq!(port.wait_ready(Duration::from_secs(5)), Ok(true));
        assert_eq!(transport.writes().len(), 3);
    }

    #[test]
    fn wait_ready_gives_up_at_the_deadline() {
        let transport = MockTransport::with_device(HWJ);
        let session = connected_session(&transport);
        let port = CommandPort::with_config(
            &session,
            Duration::from_millis(1),
            Duration::from_millis(5),
        );

        // Every poll times out; the deadline cuts the loop.
        assert_eq!(port.wait_ready(Duration::from_millis(30)), Ok(false));
        assert!(!transport.writes().is_empty());
    }

    #[test]
    fn wait_ready_aborts_on_real_failures() {
        let transport = MockTransport::with_device(HWJ);
        transport.push_read_failure(crate::error::TransportError::NoDevice);
        let session = connected_session(&transport);
        let port = CommandPort::with_config(
            &session,
            Duration::from_millis(1),
            Duration::from_millis(20),
        );

        assert_eq!(
            port.wait_ready(Duration::from_secs(1)),
            Err(EngineError::Transfer(
                crate::error::TransportError::NoDevice
            ))
        );
    }
}
