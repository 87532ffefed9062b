//! Common error types
//!
//! The taxonomy mirrors how failures actually propagate through the bridge:
//! enumeration and permission outcomes travel as values, write-path failures
//! are converted into a state reset, and only genuinely unexpected
//! conditions surface as errors to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Enumeration returned nothing; a valid steady state, not a fault
    #[error("no candidate serial device attached")]
    NoDeviceFound,

    /// Host declined access; recoverable only through a new explicit request
    #[error("USB permission denied for device {device}")]
    PermissionDenied { device: String },

    /// Physical open/configure failed; the device is momentarily unusable
    #[error("failed to open serial port {port}: {reason}")]
    PortOpen { port: String, reason: String },

    /// Write timed out or failed; the session is closed, not retried
    #[error("write to physical port failed: {0}")]
    Write(String),

    /// The pump's blocking read failed; terminates that pump
    #[error("port read failed: {0}")]
    PumpRead(String),

    /// Pseudo-terminal setup or I/O failure
    #[error("pty error: {0}")]
    Pty(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
