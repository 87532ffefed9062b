//! Device identity and permission state types
//!
//! Shared between the enumerator, the permission gate, and the connection
//! manager. A [`DeviceDescriptor`] is immutable once returned by
//! enumeration; permission outcomes are cached per [`DeviceKey`] so a
//! re-plugged adapter keeps its grant.

use std::fmt;

/// Correlation id carried by a permission request and echoed by the
/// matching decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Identity under which access permission is cached.
///
/// Keyed on what survives a replug (vendor/product id plus serial number
/// when the adapter reports one), not on the volatile port name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.serial_number {
            Some(serial) => write!(
                f,
                "{:04x}:{:04x}/{}",
                self.vendor_id, self.product_id, serial
            ),
            None => write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

/// A discovered USB serial adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// System device name, e.g. `/dev/ttyUSB0`
    pub port_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Adapter profile that matched this device (e.g. "ftdi", "ch34x")
    pub driver: &'static str,
    /// Serial channels the adapter chip exposes; the bridge uses the first
    pub port_count: usize,
}

impl DeviceDescriptor {
    /// Identity under which permission for this device is cached.
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial_number: self.serial_number.clone(),
        }
    }

    /// Human-readable description for logs and `--list-devices` output.
    pub fn description(&self) -> String {
        let manufacturer = self.manufacturer.as_deref().unwrap_or("Unknown");
        let product = self.product.as_deref().unwrap_or("Unknown");

        format!(
            "{} at {} — {} {} (VID: {:04x}, PID: {:04x})",
            self.driver, self.port_name, manufacturer, product, self.vendor_id, self.product_id
        )
    }
}

/// Cached outcome of a permission request for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionState {
    /// Never asked
    #[default]
    Unknown,
    /// Request in flight, waiting for the host's decision
    Requested(RequestId),
    /// Host granted access; persists until the host revokes it
    Granted,
    /// Host declined; a new explicit request is required to recover
    Denied,
}

impl PermissionState {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionState::Granted)
    }
}
