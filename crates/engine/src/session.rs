//! Device session lifecycle.
//!
//! A session owns at most one open device and is the single point of
//! truth for "is a device currently usable". Connect and disconnect are
//! synchronous; the transient `Connecting`/`Disconnecting` states exist so
//! re-entrant calls from other threads fail cleanly instead of racing the
//! transition in flight.
//!
//! Locking is deliberately flat: the state mutex covers only the state
//! machine, the link mutex serializes everything that touches the open
//! device (transfers and teardown), and the two are never held at the
//! same time.

use crate::error::{EngineError, Result};
use crate::identity::DeviceIdentity;
use crate::transfer::TransferProgress;
use crate::transport::{OpenedDevice, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Lifecycle of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device held.
    Disconnected,
    /// A `connect` call is searching and opening.
    Connecting,
    /// A device is open; transfers may run.
    Connected,
    /// A `disconnect` call is fencing transfers and closing.
    Disconnecting,
}

#[derive(Debug, Clone, Copy)]
struct StateCell {
    state: SessionState,
    /// The matched identity; `Some` exactly while `Connected`.
    identity: Option<DeviceIdentity>,
}

/// Connect/disconnect state machine plus exclusive ownership of the open
/// device.
///
/// Every method takes `&self`, so a session is shared behind an [`Arc`]
/// when transfers and progress polling run on different threads.
///
/// [`Arc`]: std::sync::Arc
pub struct DeviceSession<T: Transport> {
    transport: T,
    state: Mutex<StateCell>,
    /// Serialization point for transfers and teardown. `Some` exactly
    /// while the session is connected.
    link: Mutex<Option<OpenedDevice<T::Handle>>>,
    /// Raised by `disconnect` to abort an in-flight transfer.
    cancel: AtomicBool,
    progress: TransferProgress,
}

impl<T: Transport> DeviceSession<T> {
    /// Creates a disconnected session over `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: Mutex::new(StateCell {
                state: SessionState::Disconnected,
                identity: None,
            }),
            link: Mutex::new(None),
            cancel: AtomicBool::new(false),
            progress: TransferProgress::new(),
        }
    }

    /// Opens the first attached device matching `filter` (zero fields are
    /// wildcards).
    ///
    /// Returns `Ok(true)` once connected and `Ok(false)` when no attached
    /// device matches; the latter is a normal outcome and the session
    /// stays disconnected. Fails with [`EngineError::AlreadyConnected`]
    /// unless the session is fully disconnected, and with
    /// [`EngineError::Connection`] when the transport cannot open the
    /// matched device.
    pub fn connect(&self, filter: DeviceIdentity) -> Result<bool> {
        {
            let mut cell = self.state.lock().unwrap();
            if cell.state != SessionState::Disconnected {
                return Err(EngineError::AlreadyConnected);
            }
            cell.state = SessionState::Connecting;
        }

        debug!("Connecting with filter {filter}");
        match self.transport.open(filter) {
            Ok(Some(device)) => {
                let identity = device.identity;
                *self.link.lock().unwrap() = Some(device);
                self.set_state(SessionState::Connected, Some(identity));
                info!("Connected to {identity}");
                Ok(true)
            }
            Ok(None) => {
                self.set_state(SessionState::Disconnected, None);
                debug!("No attached device matches {filter}");
                Ok(false)
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected, None);
                warn!("Opening a device matching {filter} failed: {e}");
                Err(EngineError::Connection(e))
            }
        }
    }

    /// Closes the session.
    ///
    /// Returns `false` when nothing is connected (including while another
    /// call is mid-transition, which owns the state). An in-flight
    /// transfer is asked to cancel and teardown waits for it to release
    /// the device, so the handle is never closed under a transfer. A
    /// transport close failure is logged as informational; the session
    /// still ends up `Disconnected` and the call still returns `true`.
    pub fn disconnect(&self) -> bool {
        {
            let mut cell = self.state.lock().unwrap();
            if cell.state != SessionState::Connected {
                return false;
            }
            cell.state = SessionState::Disconnecting;
            cell.identity = None;
        }

        // Ask any in-flight transfer to bail, then wait our turn at the
        // serialization point.
        self.cancel.store(true, Ordering::Relaxed);
        let device = {
            let mut link = self.link.lock().unwrap();
            self.cancel.store(false, Ordering::Relaxed);
            link.take()
        };

        if let Some(device) = device {
            let identity = device.identity;
            match self.transport.close(device) {
                Ok(()) => info!("Disconnected from {identity}"),
                Err(e) => warn!("Disconnected from {identity}; transport close reported: {e}"),
            }
        }
        self.set_state(SessionState::Disconnected, None);
        true
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap().state
    }

    /// The identity matched by the last successful connect, while
    /// connected.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.state.lock().unwrap().identity
    }

    /// Whether a device is currently open.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    fn set_state(&self, state: SessionState, identity: Option<DeviceIdentity>) {
        let mut cell = self.state.lock().unwrap();
        cell.state = state;
        cell.identity = identity;
    }

    pub(crate) fn lock_link(&self) -> MutexGuard<'_, Option<OpenedDevice<T::Handle>>> {
        self.link.lock().unwrap()
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub(crate) fn progress_counter(&self) -> &TransferProgress {
        &self.progress
    }
}
