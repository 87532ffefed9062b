//! Frame encoding and incremental decoding
//!
//! The consumer signals session-start and line-speed intent in-band by
//! prefixing each logical write with a fixed header; no ioctl side channel
//! exists. This module defines that wire convention and a streaming decoder
//! for it.
//!
//! # Frame format (version 1)
//!
//! ```text
//! offset  size  field
//! 0       1     magic (0xA7)
//! 1       1     version (1)
//! 2       1     flags (bit 0: start-of-session; others reserved, zero)
//! 3       1     reserved (zero)
//! 4       4     baud code, little-endian u32
//! 8       2     payload length, little-endian u16
//! 10      n     payload bytes
//! ```
//!
//! Maximum payload is 16 KiB per frame. A malformed header aborts that
//! frame only: [`FrameDecoder`] reports a typed error, scans forward to the
//! next magic byte, and keeps going.

use crate::error::{FramingError, Result};
use crate::frame::SerialFrame;
use bytes::{Buf, BytesMut};

/// Frame boundary marker
pub const FRAME_MAGIC: u8 = 0xA7;

/// Current framing version
pub const FRAMING_VERSION: u8 = 1;

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 10;

/// Maximum allowed payload per frame (16 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

const FLAG_START_OF_SESSION: u8 = 0x01;
const FLAG_RESERVED_MASK: u8 = !FLAG_START_OF_SESSION;

/// Encode a frame into its wire representation.
///
/// # Example
/// ```
/// use framing::{encode_frame, SerialFrame, FRAME_MAGIC};
///
/// let frame = SerialFrame::new(true, 250_000, vec![b'M', b'1', b'1', b'0']);
/// let bytes = encode_frame(&frame).unwrap();
/// assert_eq!(bytes[0], FRAME_MAGIC);
/// assert_eq!(bytes.len(), 10 + 4);
/// ```
pub fn encode_frame(frame: &SerialFrame) -> Result<Vec<u8>> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FramingError::PayloadTooLarge {
            size: frame.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    out.push(FRAME_MAGIC);
    out.push(FRAMING_VERSION);
    out.push(if frame.start_of_session {
        FLAG_START_OF_SESSION
    } else {
        0
    });
    out.push(0); // reserved
    out.extend_from_slice(&frame.baud_code.to_le_bytes());
    out.extend_from_slice(&(frame.payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&frame.payload);

    Ok(out)
}

/// Incremental frame decoder.
///
/// Reads off a pty master arrive with arbitrary fragmentation: a frame may
/// span several reads, and one read may carry several frames. The decoder
/// buffers pushed bytes and yields complete frames as they materialize.
///
/// # Example
/// ```
/// use framing::{encode_frame, FrameDecoder, SerialFrame};
///
/// let frame = SerialFrame::new(false, 115_200, vec![1, 2, 3]);
/// let wire = encode_frame(&frame).unwrap();
///
/// let mut decoder = FrameDecoder::new();
/// // Feed the bytes split across two reads
/// decoder.push(&wire[..5]);
/// assert!(decoder.next_frame().unwrap().is_none());
/// decoder.push(&wire[5..]);
/// assert_eq!(decoder.next_frame().unwrap(), Some(frame));
/// ```
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes awaiting a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Returns an error when
    /// the buffered stream is malformed; the offending bytes have been
    /// consumed and the decoder has resynchronized, so the caller logs the
    /// error and simply calls again.
    pub fn next_frame(&mut self) -> Result<Option<SerialFrame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf[0] != FRAME_MAGIC {
            let skipped = self.resync(0);
            return Err(FramingError::Desynchronized { skipped });
        }

        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = self.buf[1];
        if version != FRAMING_VERSION {
            self.resync(1);
            return Err(FramingError::UnsupportedVersion {
                found: version,
                expected: FRAMING_VERSION,
            });
        }

        let flags = self.buf[2];
        let reserved = self.buf[3];
        if flags & FLAG_RESERVED_MASK != 0 || reserved != 0 {
            self.resync(1);
            return Err(FramingError::MalformedHeader { flags, reserved });
        }

        let baud_code = u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
        let payload_len = u16::from_le_bytes([self.buf[8], self.buf[9]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            self.resync(1);
            return Err(FramingError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if self.buf.len() < HEADER_LEN + payload_len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(payload_len).freeze();

        Ok(Some(SerialFrame {
            start_of_session: flags & FLAG_START_OF_SESSION != 0,
            baud_code,
            payload,
        }))
    }

    /// Drop bytes up to the next magic byte, starting the scan at `from`.
    /// Returns how many bytes were discarded.
    fn resync(&mut self, from: usize) -> usize {
        let skip = self.buf[from..]
            .iter()
            .position(|&b| b == FRAME_MAGIC)
            .map(|pos| from + pos)
            .unwrap_or(self.buf.len());
        self.buf.advance(skip);
        skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(frame: &SerialFrame) -> Vec<u8> {
        encode_frame(frame).unwrap()
    }

    #[test]
    fn test_roundtrip_single_frame() {
        let frame = SerialFrame::new(true, 250_000, vec![b'G', b'2', b'8', b'\n']);
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire(&frame));

        assert_eq!(decoder.next_frame().unwrap(), Some(frame));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let a = SerialFrame::new(true, 250_000, vec![1, 2, 3]);
        let b = SerialFrame::new(false, 250_000, vec![4, 5]);
        let mut bytes = wire(&a);
        bytes.extend_from_slice(&wire(&b));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame().unwrap(), Some(a));
        assert_eq!(decoder.next_frame().unwrap(), Some(b));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn test_byte_at_a_time_fragmentation() {
        let frame = SerialFrame::new(false, 0o010002, vec![0xde, 0xad, 0xbe, 0xef]);
        let mut decoder = FrameDecoder::new();

        let bytes = wire(&frame);
        for (i, byte) in bytes.iter().enumerate() {
            decoder.push(std::slice::from_ref(byte));
            let decoded = decoder.next_frame().unwrap();
            if i < bytes.len() - 1 {
                assert!(decoded.is_none(), "frame complete too early at byte {}", i);
            } else {
                assert_eq!(decoded, Some(frame.clone()));
            }
        }
    }

    #[test]
    fn test_empty_payload_frame() {
        // A bare session announcement carries no payload at all
        let frame = SerialFrame::new(true, 115_200, Vec::<u8>::new());
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire(&frame));

        let decoded = decoder.next_frame().unwrap().unwrap();
        assert!(decoded.start_of_session);
        assert!(decoded.is_keep_alive());
    }

    #[test]
    fn test_garbage_prefix_resyncs() {
        let frame = SerialFrame::new(false, 250_000, vec![9, 9]);
        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend_from_slice(&wire(&frame));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        assert_eq!(
            decoder.next_frame(),
            Err(FramingError::Desynchronized { skipped: 3 })
        );
        assert_eq!(decoder.next_frame().unwrap(), Some(frame));
    }

    #[test]
    fn test_unknown_version_skips_one_frame_only() {
        let good = SerialFrame::new(false, 250_000, vec![7]);
        let mut bytes = wire(&good);
        bytes[1] = 99; // corrupt the version
        let tail = wire(&good);
        bytes.extend_from_slice(&tail);

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        assert_eq!(
            decoder.next_frame(),
            Err(FramingError::UnsupportedVersion {
                found: 99,
                expected: FRAMING_VERSION,
            })
        );
        // Resync lands on the next frame; junk in between is reported, not fatal
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    assert_eq!(frame, good);
                    break;
                }
                Ok(None) => panic!("decoder lost the trailing frame"),
                Err(_) => continue,
            }
        }
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let frame = SerialFrame::new(false, 9600, vec![1, 2]);
        let mut bytes = wire(&frame);
        bytes[2] |= 0x80;

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(FramingError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_oversize_payload_rejected_on_encode() {
        let frame = SerialFrame::new(false, 9600, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            encode_frame(&frame),
            Err(FramingError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversize_length_field_rejected_on_decode() {
        let mut bytes = vec![FRAME_MAGIC, FRAMING_VERSION, 0, 0];
        bytes.extend_from_slice(&250_000u32.to_le_bytes());
        bytes.extend_from_slice(&u16::MAX.to_le_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(FramingError::PayloadTooLarge { .. })
        ));
    }
}
