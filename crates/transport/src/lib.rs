//! libusb backend for the plotter communication engine.
//!
//! This crate provides [`UsbTransport`], the production implementation of
//! the engine's `Transport` trait. It covers the three hardware-facing
//! concerns the engine delegates:
//!
//! - scanning the bus and claiming a plotter's bulk interface ([`device`])
//! - moving payload chunks and status replies over bulk endpoints ([`device`])
//! - turning libusb hotplug callbacks into engine events ([`hotplug`])
//!
//! Everything here is synchronous; callers that need async integration wrap
//! the engine in `spawn_blocking` the way the `plotctl` binary does.

pub mod device;
pub mod hotplug;

pub use device::{DEFAULT_WRITE_TIMEOUT, UsbLink, UsbTransport};
pub use hotplug::UsbHotplugSubscription;
