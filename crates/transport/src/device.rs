//! Device scanning and bulk transfers over libusb.
//!
//! [`UsbTransport`] owns a libusb context and implements the engine's
//! [`Transport`] trait: it scans the bus for a matching plotter, claims its
//! bulk interface, and moves payload bytes over the claimed endpoints.

use crate::hotplug::UsbHotplugSubscription;
use async_channel::Sender;
use engine::{DeviceIdentity, HotplugEvent, OpenedDevice, Transport, TransportError};
use rusb::{ConfigDescriptor, Context, Device, Direction, TransferType, UsbContext};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default timeout for bulk OUT transfers.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read buffer size when the device exposes no bulk IN endpoint metadata.
const DEFAULT_READ_LEN: usize = 64;

/// Device class of USB hubs; hubs are never plotters.
const CLASS_HUB: u8 = 0x09;

/// libusb-backed transport.
///
/// Cloning is cheap and shares the underlying libusb context, so a session
/// and a hotplug monitor can run over the same instance.
#[derive(Clone)]
pub struct UsbTransport {
    /// USB context shared by scans, transfers, and hotplug callbacks
    context: Context,
    /// Timeout applied to every bulk OUT transfer
    write_timeout: Duration,
}

impl UsbTransport {
    /// Create a transport with its own libusb context.
    pub fn new() -> Result<Self, TransportError> {
        let context = Context::new().map_err(map_usb_error)?;

        Ok(Self {
            context,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Replace the bulk OUT timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Open the matched device and claim its bulk interface.
    fn open_matched(
        &self,
        device: &Device<Context>,
        identity: DeviceIdentity,
    ) -> Result<OpenedDevice<UsbLink>, TransportError> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {identity}: {e}");
            map_usb_error(e)
        })?;

        let config = device.active_config_descriptor().map_err(|e| {
            warn!("Failed to read active config descriptor for {identity}: {e}");
            map_usb_error(e)
        })?;

        let endpoints = find_bulk_endpoints(&config).ok_or_else(|| {
            warn!("Device {identity} exposes no bulk OUT endpoint");
            TransportError::NotFound
        })?;

        // Detach the kernel driver if one holds the interface (usblp grabs
        // printer-class devices on Linux).
        match handle.kernel_driver_active(endpoints.interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {identity}",
                    endpoints.interface
                );
                if let Err(e) = handle.detach_kernel_driver(endpoints.interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {e}",
                        endpoints.interface
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                trace!("Could not check kernel driver status: {e}");
            }
        }

        handle.claim_interface(endpoints.interface).map_err(|e| {
            warn!(
                "Failed to claim interface {} on {identity}: {e}",
                endpoints.interface
            );
            map_usb_error(e)
        })?;

        debug!(
            "Claimed interface {} on {identity}: bulk OUT {:#04x} ({} byte packets), bulk IN {:?}",
            endpoints.interface,
            endpoints.endpoint_out,
            endpoints.out_max_packet,
            endpoints.endpoint_in,
        );

        let read_len = endpoints.in_max_packet.unwrap_or(DEFAULT_READ_LEN);
        let link = UsbLink {
            handle,
            interface: endpoints.interface,
            endpoint_out: endpoints.endpoint_out,
            endpoint_in: endpoints.endpoint_in,
            read_len,
        };

        Ok(OpenedDevice::new(link, identity, endpoints.out_max_packet))
    }
}

/// An opened plotter: a claimed interface plus its bulk endpoint addresses.
pub struct UsbLink {
    /// Open libusb handle
    handle: rusb::DeviceHandle<Context>,
    /// Claimed interface number
    interface: u8,
    /// Bulk OUT endpoint address
    endpoint_out: u8,
    /// Bulk IN endpoint address, when the device has one
    endpoint_in: Option<u8>,
    /// Read buffer size, taken from the IN endpoint's max packet size
    read_len: usize,
}

impl Transport for UsbTransport {
    type Handle = UsbLink;
    type Subscription = UsbHotplugSubscription;

    fn open(
        &self,
        filter: DeviceIdentity,
    ) -> Result<Option<OpenedDevice<Self::Handle>>, TransportError> {
        let devices = self.context.devices().map_err(map_usb_error)?;

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    trace!(
                        "Skipping device with unreadable descriptor (bus={}, addr={}): {e}",
                        device.bus_number(),
                        device.address()
                    );
                    continue;
                }
            };

            if descriptor.class_code() == CLASS_HUB {
                continue;
            }

            let identity = DeviceIdentity::new(descriptor.vendor_id(), descriptor.product_id());
            if !filter.matches(identity) {
                continue;
            }

            debug!(
                "Matched {identity} at bus={}, addr={}",
                device.bus_number(),
                device.address()
            );
            // The first match is the candidate; if it cannot be opened the
            // scan does not fall through to later devices.
            return self.open_matched(&device, identity).map(Some);
        }

        Ok(None)
    }

    fn close(&self, device: OpenedDevice<Self::Handle>) -> Result<(), TransportError> {
        let link = device.handle;
        let mut result = Ok(());

        if let Err(e) = link.handle.release_interface(link.interface) {
            warn!("Failed to release interface {}: {e}", link.interface);
            result = Err(map_usb_error(e));
        }

        // Hand the device back to the kernel driver we may have detached.
        match link.handle.attach_kernel_driver(link.interface) {
            Ok(()) => debug!("Reattached kernel driver to interface {}", link.interface),
            Err(e) => trace!(
                "Could not reattach kernel driver to interface {}: {e}",
                link.interface
            ),
        }

        debug!("Closed {}", device.identity);
        result
    }

    fn write(
        &self,
        device: &mut OpenedDevice<Self::Handle>,
        bytes: &[u8],
    ) -> Result<usize, TransportError> {
        let link = &device.handle;
        link.handle
            .write_bulk(link.endpoint_out, bytes, self.write_timeout)
            .map_err(map_usb_error)
    }

    fn read(
        &self,
        device: &mut OpenedDevice<Self::Handle>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let link = &device.handle;
        let Some(endpoint_in) = link.endpoint_in else {
            warn!("Read requested but {} has no bulk IN endpoint", device.identity);
            return Err(TransportError::NotFound);
        };

        let mut buffer = vec![0u8; link.read_len];
        match link.handle.read_bulk(endpoint_in, &mut buffer, timeout) {
            Ok(len) => {
                buffer.truncate(len);
                Ok(buffer)
            }
            Err(e) => Err(map_usb_error(e)),
        }
    }

    fn subscribe_hotplug(
        &self,
        events: Sender<HotplugEvent>,
    ) -> Result<Self::Subscription, TransportError> {
        UsbHotplugSubscription::register(self.context.clone(), events)
    }
}

/// Bulk endpoints discovered on a claimed interface.
struct BulkEndpoints {
    interface: u8,
    endpoint_out: u8,
    out_max_packet: usize,
    endpoint_in: Option<u8>,
    in_max_packet: Option<usize>,
}

/// Find the first interface with a bulk OUT endpoint.
///
/// Plotters stream commands over bulk OUT; a bulk IN endpoint on the same
/// interface carries status replies when present.
fn find_bulk_endpoints(config: &ConfigDescriptor) -> Option<BulkEndpoints> {
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            let mut out = None;
            let mut input = None;

            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::Out if out.is_none() => {
                        out = Some((endpoint.address(), endpoint.max_packet_size() as usize));
                    }
                    Direction::In if input.is_none() => {
                        input = Some((endpoint.address(), endpoint.max_packet_size() as usize));
                    }
                    _ => {}
                }
            }

            if let Some((endpoint_out, out_max_packet)) = out {
                return Some(BulkEndpoints {
                    interface: descriptor.interface_number(),
                    endpoint_out,
                    out_max_packet,
                    endpoint_in: input.map(|(address, _)| address),
                    in_max_packet: input.map(|(_, max_packet)| max_packet),
                });
            }
        }
    }

    None
}

/// Map rusb::Error to the engine's transport error type.
pub(crate) fn map_usb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        _ => TransportError::Other {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_usb_error() {
        assert_eq!(map_usb_error(rusb::Error::Timeout), TransportError::Timeout);
        assert_eq!(map_usb_error(rusb::Error::Pipe), TransportError::Pipe);
        assert_eq!(
            map_usb_error(rusb::Error::NoDevice),
            TransportError::NoDevice
        );
        assert_eq!(map_usb_error(rusb::Error::Access), TransportError::Access);
        assert_eq!(
            map_usb_error(rusb::Error::Overflow),
            TransportError::Other {
                message: rusb::Error::Overflow.to_string()
            }
        );
    }

    #[test]
    fn test_write_timeout_override() {
        let transport = UsbTransport::new()
            .unwrap()
            .with_write_timeout(Duration::from_secs(2));
        assert_eq!(transport.write_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_open_returns_none_for_unassigned_vendor() {
        let transport = UsbTransport::new().unwrap();
        // 0xdead is not an assigned vendor ID; the scan finds nothing.
        let result = transport
            .open(DeviceIdentity::new(0xdead, 0xbeef))
            .expect("bus scan");
        assert!(result.is_none());
    }
}
