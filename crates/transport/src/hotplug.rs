//! Hotplug callback registration and the libusb event thread.
//!
//! libusb only fires hotplug callbacks while some thread is inside
//! `libusb_handle_events`, so registering a subscription also spawns a
//! dedicated event thread. Callbacks translate device arrivals and removals
//! into engine events and forward them over the subscription's channel.

use crate::device::map_usb_error;
use async_channel::Sender;
use engine::{DeviceIdentity, HotplugEvent, TransportError};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Poll interval for the libusb event loop.
///
/// Also bounds how long dropping a subscription waits for the event thread.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Translates libusb hotplug callbacks into engine events.
struct HotplugForwarder {
    events: Sender<HotplugEvent>,
}

impl HotplugForwarder {
    fn forward(&self, event: HotplugEvent) {
        // The receiver side is gone once monitoring stops; late callbacks
        // have nowhere to go and are dropped.
        if self.events.send_blocking(event).is_err() {
            trace!("Dropping hotplug event, channel closed");
        }
    }

    fn identity_of<T: UsbContext>(device: &Device<T>) -> Result<DeviceIdentity, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        Ok(DeviceIdentity::new(
            descriptor.vendor_id(),
            descriptor.product_id(),
        ))
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        match Self::identity_of(&device) {
            Ok(identity) => {
                debug!(
                    "Hotplug arrival: {identity} (bus={}, addr={})",
                    device.bus_number(),
                    device.address()
                );
                self.forward(HotplugEvent::Arrival { identity });
            }
            Err(e) => {
                warn!("Arrived device has an unreadable descriptor: {e}");
                self.forward(HotplugEvent::Error {
                    message: format!("unreadable descriptor on arrival: {e}"),
                });
            }
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        // Descriptors are cached by libusb, so they stay readable after
        // the device is gone.
        match Self::identity_of(&device) {
            Ok(identity) => {
                debug!(
                    "Hotplug removal: {identity} (bus={}, addr={})",
                    device.bus_number(),
                    device.address()
                );
                self.forward(HotplugEvent::Removal { identity });
            }
            Err(e) => {
                warn!("Departed device has an unreadable descriptor: {e}");
                self.forward(HotplugEvent::Error {
                    message: format!("unreadable descriptor on removal: {e}"),
                });
            }
        }
    }
}

/// A live hotplug registration plus the event thread that drives it.
///
/// Dropping the subscription unhooks the libusb callback and stops the
/// event thread; the engine relies on this to release its observer.
pub struct UsbHotplugSubscription {
    registration: Option<Registration<Context>>,
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl UsbHotplugSubscription {
    pub(crate) fn register(
        context: Context,
        events: Sender<HotplugEvent>,
    ) -> Result<Self, TransportError> {
        if !rusb::has_hotplug() {
            return Err(TransportError::Other {
                message: "hotplug callbacks are not supported on this platform".to_string(),
            });
        }

        let forwarder = HotplugForwarder {
            events: events.clone(),
        };
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&context, Box::new(forwarder))
            .map_err(map_usb_error)?;
        debug!("Hotplug callbacks registered");

        let stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_event_thread(context, events, Arc::clone(&stop));

        Ok(Self {
            registration: Some(registration),
            stop,
            pump: Some(pump),
        })
    }
}

impl Drop for UsbHotplugSubscription {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Unhook the callback before the context loses its event thread.
        self.registration.take();
        if let Some(pump) = self.pump.take()
            && pump.join().is_err()
        {
            warn!("USB event thread panicked during shutdown");
        }
        debug!("Hotplug subscription released");
    }
}

/// Spawn the thread that runs the libusb event loop.
///
/// Failures inside the loop are reported to the subscriber as
/// [`HotplugEvent::Error`] rather than silently retried.
fn spawn_event_thread(
    context: Context,
    events: Sender<HotplugEvent>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-events".to_string())
        .spawn(move || {
            debug!("USB event thread started");

            while !stop.load(Ordering::Relaxed) {
                match context.handle_events(Some(EVENT_POLL_INTERVAL)) {
                    Ok(()) => {}
                    Err(rusb::Error::Interrupted) => {
                        trace!("USB event handling interrupted");
                    }
                    Err(e) => {
                        error!("Error handling USB events: {e}");
                        let report = HotplugEvent::Error {
                            message: format!("usb event loop: {e}"),
                        };
                        if events.send_blocking(report).is_err() {
                            break;
                        }
                        // Back off so a persistent failure cannot spin.
                        std::thread::sleep(EVENT_POLL_INTERVAL);
                    }
                }
            }

            debug!("USB event thread stopped");
        })
        .expect("Failed to spawn USB event thread")
}
