//! Device identity and wildcard matching.
//!
//! Devices are addressed by their 16-bit USB vendor/product pair. The same
//! pair doubles as a filter for connect and hotplug operations, with `0`
//! in either field meaning "match any". The plotters this engine targets
//! share one vendor id across several product revisions, so callers
//! frequently pin the vendor and leave the product open.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A USB `(vendor, product)` identifier pair.
///
/// When used as a filter, a zero field matches any value. A connected
/// session always stores the actual identity read from the device
/// descriptor, never a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// USB vendor identifier (`idVendor`).
    pub vendor_id: u16,
    /// USB product identifier (`idProduct`).
    pub product_id: u16,
}

impl DeviceIdentity {
    /// Filter that matches every device.
    pub const ANY: Self = Self {
        vendor_id: 0,
        product_id: 0,
    };

    /// Creates an identity from raw vendor/product values.
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Evaluates this value as a filter against an actual device
    /// identity: non-zero fields must match exactly, zero fields match
    /// anything.
    pub fn matches(&self, actual: DeviceIdentity) -> bool {
        (self.vendor_id == 0 || self.vendor_id == actual.vendor_id)
            && (self.product_id == 0 || self.product_id == actual.product_id)
    }

    /// Returns `true` when neither field is a wildcard.
    pub fn is_exact(&self) -> bool {
        self.vendor_id != 0 && self.product_id != 0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}
