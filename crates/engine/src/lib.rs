//! Host-side communication engine for USB label plotters.
//!
//! The engine owns everything between "a plotter is attached somewhere"
//! and "these bytes were delivered": session lifecycle against a
//! vendor/product filter, chunked bulk transfers with live progress,
//! request/response correlation, hotplug watching, and the pacing rules
//! of the plotters' line-oriented command protocol. The USB stack itself
//! is consumed through the [`Transport`] trait: the `transport` crate
//! provides the libusb implementation and tests use the built-in mock.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────────────────────┐
//!                 │            caller threads          │
//!                 └──────┬──────────────┬──────────────┘
//!                        │              │
//!                 CommandPort      HotplugMonitor
//!                        │              │ observer (pump thread)
//!                 DeviceSession         │
//!                (send / connect)       │
//!                        │              │ events (channel)
//!                 ┌──────┴──────────────┴──────────────┐
//!                 │       Transport implementation     │
//!                 └────────────────────────────────────┘
//! ```
//!
//! Transfers are serialized on the session; the monitor runs beside them
//! and never waits on a transfer.
//!
//! # Example
//!
//! ```
//! use engine::test_utils::MockTransport;
//! use engine::{DeviceIdentity, DeviceSession};
//!
//! let hwj = DeviceIdentity::new(0x0483, 0x5750);
//! let transport = MockTransport::with_device(hwj);
//! let session = DeviceSession::new(transport);
//!
//! // Wildcard product: any plotter from this vendor.
//! assert!(session.connect(DeviceIdentity::new(0x0483, 0)).unwrap());
//! assert_eq!(session.identity(), Some(hwj));
//!
//! let sent = session.send(b"PU0,0;PD100,100;PG;@").unwrap();
//! assert_eq!(session.progress(), sent as u64);
//!
//! assert!(session.disconnect());
//! ```

pub mod command;
pub mod error;
pub mod hotplug;
pub mod identity;
pub mod session;
pub mod test_utils;
pub mod transfer;
pub mod transport;

pub use command::{
    CommandPort, StatusReply, DEFAULT_RESPONSE_TIMEOUT, MIN_COMMAND_SPACING, READY_TOKEN,
    STATUS_COMMAND,
};
pub use error::{EngineError, Result, TransportError};
pub use hotplug::{HotplugEvent, HotplugMonitor, HotplugObserver};
pub use identity::DeviceIdentity;
pub use session::{DeviceSession, SessionState};
pub use transfer::TransferProgress;
pub use transport::{OpenedDevice, Transport};
