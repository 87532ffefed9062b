//! Line-speed framing convention for ptylink
//!
//! The print-management process talks to the bridge through a pseudo
//! terminal, which is a plain byte stream: there is no control channel on
//! which to signal "this is a new session" or "switch to 250000 baud". This
//! crate defines the in-band convention that carries those signals — a
//! versioned header in front of every logical write — together with an
//! incremental decoder and the baud-code mapping.
//!
//! # Example
//!
//! ```
//! use framing::{encode_frame, FrameDecoder, SerialFrame};
//!
//! // Consumer side: announce a session at 250000 baud and send a command
//! let frame = SerialFrame::new(true, 250_000, b"M115\n".to_vec());
//! let wire = encode_frame(&frame).unwrap();
//!
//! // Bridge side: bytes come off the pty master in arbitrary chunks
//! let mut decoder = FrameDecoder::new();
//! decoder.push(&wire);
//! let decoded = decoder.next_frame().unwrap().unwrap();
//! assert!(decoded.start_of_session);
//! assert_eq!(decoded.baud_rate(), Some(250_000));
//! ```

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{
    encode_frame, FrameDecoder, FRAME_MAGIC, FRAMING_VERSION, HEADER_LEN, MAX_PAYLOAD_SIZE,
};
pub use error::{FramingError, Result};
pub use frame::{baud_for_code, SerialFrame, KEEP_ALIVE_MAX_LEN, MIN_LITERAL_BAUD};
