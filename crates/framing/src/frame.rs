//! Serial frame type and baud-code resolution
//!
//! A [`SerialFrame`] is one logical write taken off the pseudo-terminal
//! master: a start-of-session marker, the requested line speed, and the raw
//! payload destined for the printer board. Frames are ephemeral; the bridge
//! decodes one, acts on it, and drops it.

use bytes::Bytes;

/// Payloads of this length or shorter are keep-alive probes, never
/// forwarded to hardware.
pub const KEEP_ALIVE_MAX_LEN: usize = 1;

/// Minimum plausible literal baud rate. Values below this that are not
/// known termios codes are rejected rather than guessed at.
pub const MIN_LITERAL_BAUD: u32 = 300;

/// One logical write from the consumer, as recovered by the frame decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    /// Consumer announced a new logical session (triggers the DTR/RTS
    /// reset handshake on reconnect)
    pub start_of_session: bool,
    /// Requested line speed: a termios speed constant or a literal rate
    pub baud_code: u32,
    /// Raw bytes for the physical port
    pub payload: Bytes,
}

impl SerialFrame {
    /// Create a frame from its parts.
    pub fn new(start_of_session: bool, baud_code: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            start_of_session,
            baud_code,
            payload: payload.into(),
        }
    }

    /// Resolve the in-band baud code to a line speed in bits per second.
    ///
    /// Returns `None` when the code is neither a known termios constant nor
    /// a plausible literal rate; callers fall back to their configured
    /// default in that case.
    pub fn baud_rate(&self) -> Option<u32> {
        baud_for_code(self.baud_code)
    }

    /// Whether this frame is a keep-alive probe (payload of at most one
    /// byte) that must not reach the hardware.
    pub fn is_keep_alive(&self) -> bool {
        self.payload.len() <= KEEP_ALIVE_MAX_LEN
    }
}

/// Map an in-band baud code to a line speed in bits per second.
///
/// The consumer side produces whatever its tty layer hands it, so two
/// encodings are accepted:
///
/// - Linux termios speed constants (`B9600` = 0o000015, `B115200` =
///   0o010002, ...), which is what a `cfsetospeed`-style path emits;
/// - literal rates of at least [`MIN_LITERAL_BAUD`], covering speeds that
///   have no termios constant. Printer firmware's customary 250000 baud is
///   the motivating case.
///
/// Known constants win over the literal interpretation.
pub fn baud_for_code(code: u32) -> Option<u32> {
    let mapped = match code {
        0o000001 => 50,
        0o000002 => 75,
        0o000003 => 110,
        0o000004 => 134,
        0o000005 => 150,
        0o000006 => 200,
        0o000007 => 300,
        0o000010 => 600,
        0o000011 => 1200,
        0o000012 => 1800,
        0o000013 => 2400,
        0o000014 => 4800,
        0o000015 => 9600,
        0o000016 => 19200,
        0o000017 => 38400,
        0o010001 => 57600,
        0o010002 => 115_200,
        0o010003 => 230_400,
        0o010004 => 460_800,
        0o010005 => 500_000,
        0o010006 => 576_000,
        0o010007 => 921_600,
        0o010010 => 1_000_000,
        0o010011 => 1_152_000,
        0o010012 => 1_500_000,
        0o010013 => 2_000_000,
        0o010014 => 2_500_000,
        0o010015 => 3_000_000,
        0o010016 => 3_500_000,
        0o010017 => 4_000_000,
        literal if literal >= MIN_LITERAL_BAUD => literal,
        _ => return None,
    };
    Some(mapped)
}
