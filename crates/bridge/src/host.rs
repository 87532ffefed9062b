//! Serial host abstraction and the system implementation
//!
//! The connection manager talks to hardware only through [`SerialHost`] and
//! [`SerialLink`], so the physical transport can be swapped for a different
//! back-end or a mock without touching the state machine. The system
//! implementation sits on the `serialport` crate: enumeration with USB
//! metadata, 8N1 line configuration, DTR/RTS control, per-handle timeouts.

use std::io::{self, Read, Write};
use std::time::Duration;

use common::{DeviceDescriptor, Error, Result};
use serialport::{DataBits, Parity, SerialPort, SerialPortType, StopBits};
use tracing::{debug, warn};

/// Line parameters for an open link. Data bits, stop bits, and parity are
/// fixed at 8/1/none; only the baud rate varies per session.
#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub baud_rate: u32,
    /// Bound on a single blocking write
    pub write_timeout: Duration,
}

/// An open physical connection to the printer board.
pub trait SerialLink: Send {
    /// Blocking read bounded by the handle's current timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer or fail within the handle's timeout.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Drive the DTR and RTS handshake lines.
    fn set_handshake(&mut self, dtr: bool, rts: bool) -> io::Result<()>;

    /// Change this handle's blocking-operation timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Clone the handle; the pump reads from its own clone while the
    /// manager keeps the write half.
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;
}

/// Enumerates candidate devices and opens links to them.
pub trait SerialHost: Send + Sync {
    /// Currently attached devices matching a supported adapter profile.
    /// Empty is a valid, non-error result.
    fn list_candidates(&self) -> Vec<DeviceDescriptor>;

    /// Open and configure a physical connection to one device.
    fn open(&self, device: &DeviceDescriptor, settings: &LinkSettings) -> Result<Box<dyn SerialLink>>;
}

/// A known USB serial adapter chipset or controller-board family.
#[derive(Debug, Clone, Copy)]
pub struct AdapterProfile {
    pub name: &'static str,
    pub vendor_id: u16,
    /// `None` matches every product id from this vendor
    pub product_ids: Option<&'static [u16]>,
    /// Serial channels the chip exposes
    pub port_count: usize,
}

/// Adapter chipsets found on 3D-printer controller boards, plus the
/// native-CDC vendors common on newer boards. Order matters: the first
/// matching profile wins, so multi-port variants precede generic entries.
pub const ADAPTER_PROFILES: &[AdapterProfile] = &[
    AdapterProfile { name: "ftdi-2232", vendor_id: 0x0403, product_ids: Some(&[0x6010]), port_count: 2 },
    AdapterProfile { name: "ftdi-4232", vendor_id: 0x0403, product_ids: Some(&[0x6011]), port_count: 4 },
    AdapterProfile { name: "ftdi", vendor_id: 0x0403, product_ids: None, port_count: 1 },
    AdapterProfile { name: "cp210x", vendor_id: 0x10c4, product_ids: Some(&[0xea60, 0xea70, 0xea71]), port_count: 1 },
    AdapterProfile { name: "ch34x", vendor_id: 0x1a86, product_ids: Some(&[0x7523, 0x7522, 0x5523]), port_count: 1 },
    AdapterProfile { name: "pl2303", vendor_id: 0x067b, product_ids: Some(&[0x2303, 0x23a3, 0x23c3]), port_count: 1 },
    AdapterProfile { name: "cdc-arduino", vendor_id: 0x2341, product_ids: None, port_count: 1 },
    AdapterProfile { name: "cdc-prusa", vendor_id: 0x2c99, product_ids: None, port_count: 1 },
    AdapterProfile { name: "cdc-rp2040", vendor_id: 0x2e8a, product_ids: None, port_count: 1 },
    AdapterProfile { name: "cdc-stm32", vendor_id: 0x0483, product_ids: Some(&[0x5740]), port_count: 1 },
];

/// Find the profile matching a VID/PID pair.
pub fn lookup_profile(vendor_id: u16, product_id: u16) -> Option<&'static AdapterProfile> {
    ADAPTER_PROFILES.iter().find(|profile| {
        profile.vendor_id == vendor_id
            && profile
                .product_ids
                .map(|pids| pids.contains(&product_id))
                .unwrap_or(true)
    })
}

/// Check a VID/PID pair against user filter patterns.
///
/// Filter format: `"VID:PID"` in hex, either part may be `"*"`, an
/// optional `0x` prefix is accepted. Invalid patterns never match.
pub fn matches_filter(vendor_id: u16, product_id: u16, filters: &[String]) -> bool {
    fn part_matches(pattern: &str, value: u16) -> bool {
        if pattern == "*" {
            return true;
        }
        u16::from_str_radix(pattern.trim_start_matches("0x"), 16)
            .map(|p| p == value)
            .unwrap_or(false)
    }

    filters.iter().any(|filter| {
        let mut parts = filter.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(vid), Some(pid), None) => {
                part_matches(vid, vendor_id) && part_matches(pid, product_id)
            }
            _ => false,
        }
    })
}

/// Host backed by the operating system's serial subsystem.
pub struct SystemSerialHost {
    /// Extra `VID:PID` patterns treated as candidates beyond the built-in
    /// profile table
    extra_filters: Vec<String>,
}

impl SystemSerialHost {
    pub fn new(extra_filters: Vec<String>) -> Self {
        Self { extra_filters }
    }
}

impl SerialHost for SystemSerialHost {
    fn list_candidates(&self) -> Vec<DeviceDescriptor> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "serial port enumeration failed");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for port in ports {
            let usb = match &port.port_type {
                SerialPortType::UsbPort(info) => info,
                _ => continue,
            };

            let (driver, port_count) = match lookup_profile(usb.vid, usb.pid) {
                Some(profile) => (profile.name, profile.port_count),
                None if matches_filter(usb.vid, usb.pid, &self.extra_filters) => ("filter", 1),
                None => {
                    debug!(
                        port = %port.port_name,
                        vid = %format!("{:04x}", usb.vid),
                        pid = %format!("{:04x}", usb.pid),
                        "ignoring unrecognized USB serial device"
                    );
                    continue;
                }
            };

            candidates.push(DeviceDescriptor {
                port_name: port.port_name.clone(),
                vendor_id: usb.vid,
                product_id: usb.pid,
                serial_number: usb.serial_number.clone(),
                manufacturer: usb.manufacturer.clone(),
                product: usb.product.clone(),
                driver,
                port_count,
            });
        }

        debug!(count = candidates.len(), "enumerated candidate devices");
        candidates
    }

    fn open(&self, device: &DeviceDescriptor, settings: &LinkSettings) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(&device.port_name, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .timeout(settings.write_timeout)
            .open()
            .map_err(|e| Error::PortOpen {
                port: device.port_name.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(SystemLink { port }))
    }
}

/// [`SerialLink`] over a `serialport` handle.
struct SystemLink {
    port: Box<dyn SerialPort>,
}

fn to_io(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl SerialLink for SystemLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn set_handshake(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        self.port.write_data_terminal_ready(dtr).map_err(to_io)?;
        self.port.write_request_to_send(rts).map_err(to_io)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(to_io)
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let port = self.port.try_clone().map_err(to_io)?;
        Ok(Box::new(SystemLink { port }))
    }
}
