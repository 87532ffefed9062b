//! Framing error types

use thiserror::Error;

/// Errors raised while encoding or decoding serial frames.
///
/// A decode error is fatal for the offending frame only: the decoder
/// resynchronizes on the next magic byte and the caller keeps reading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Stream did not start with the frame magic; leading bytes were skipped
    #[error("Desynchronized stream: skipped {skipped} bytes before next frame boundary")]
    Desynchronized { skipped: usize },

    /// Header declared a framing version this decoder does not speak
    #[error("Unsupported framing version: {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    /// Reserved header bits were set
    #[error("Malformed frame header: reserved bits set (flags: {flags:#04x}, reserved: {reserved:#04x})")]
    MalformedHeader { flags: u8, reserved: u8 },

    /// Declared payload length exceeds the per-frame maximum
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Type alias for framing results
pub type Result<T> = std::result::Result<T, FramingError>;
