//! Nextion instruction encoding and response classification.
//!
//! The display speaks a plain-text command protocol over the serial link.
//! Every instruction is ASCII text followed by three `0xFF` terminator
//! bytes:
//!
//! ```text
//! +----------------------+------+------+------+
//! |  ASCII command text  | 0xFF | 0xFF | 0xFF |
//! +----------------------+------+------+------+
//! ```
//!
//! During upload the display answers with single status bytes rather than
//! terminated frames: `0x05` accepts a command or packet, `0x08` rejects it.

/// Terminator byte; every command ends with three of these.
pub const COMMAND_TERMINATOR: u8 = 0xFF;

/// Number of terminator bytes appended to each command.
pub const TERMINATOR_LEN: usize = 3;

/// Single-byte acknowledgement from the display.
pub const ACK_BYTE: u8 = 0x05;

/// Single-byte rejection from the display.
pub const ERR_BYTE: u8 = 0x08;

/// Baud rates the display may be listening on, in probing order.
///
/// Order is significant: lower rates are tried first as fallback during
/// discovery.
pub const BAUD_CANDIDATES: &[u32] = &[
    9_600, 19_200, 38_400, 57_600, 115_200, 230_400, 256_000, 512_000, 921_600,
];

/// Factory-default baud rate, used as the safe fallback transfer speed.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Preferred high-speed transfer rate for uploads.
pub const UPLOAD_BAUD: u32 = 256_000;

/// Maximum size of a single upload packet.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Chunk size for writes within a packet, matching the display's receive
/// buffer drain rate.
pub const WRITE_CHUNK_SIZE: usize = 256;

/// A display command ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
}

impl Command {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Probe command used during baud discovery; embeds the candidate rate.
    pub fn baud_probe(baud: u32) -> Self {
        Self::new(format!("bauds={baud}"))
    }

    /// Query the display's current baud rate.
    pub fn baud_query() -> Self {
        Self::new("get baud")
    }

    /// Tell the display to switch its listening rate.
    pub fn set_baud(baud: u32) -> Self {
        Self::new(format!("baud={baud}"))
    }

    /// Reset the display.
    ///
    /// The on-wire token is `rest`, exactly as the display firmware expects.
    pub fn reset() -> Self {
        Self::new("rest")
    }

    /// Announce an incoming firmware image and switch the display into
    /// upload-receive mode.
    ///
    /// # Arguments
    ///
    /// * `file_size` - Total size of the image in bytes.
    /// * `baud` - Transfer baud rate the display should expect.
    pub fn announce(file_size: u64, baud: u32) -> Self {
        Self::new(format!("whmi-wri {file_size},{baud},0"))
    }

    /// The ASCII body of the command, without terminators.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Build the complete on-wire byte sequence.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.text.len() + TERMINATOR_LEN);
        buf.extend_from_slice(self.text.as_bytes());
        buf.extend_from_slice(&[COMMAND_TERMINATOR; TERMINATOR_LEN]);
        buf
    }
}

/// Classification of a single status byte read from the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The display accepted the command or packet.
    Ack,
    /// The display rejected the command or packet.
    Err,
    /// Any other byte; meaning depends on context.
    Other(u8),
}

impl Response {
    /// Classify a status byte.
    #[must_use]
    pub fn classify(byte: u8) -> Self {
        match byte {
            ACK_BYTE => Self::Ack,
            ERR_BYTE => Self::Err,
            other => Self::Other(other),
        }
    }

    /// Whether this response is an acknowledgement.
    pub fn is_ack(self) -> bool {
        matches!(self, Self::Ack)
    }
}

/// Discovery hit test for a probe response window.
///
/// A window counts as a hit when it contains at least one byte and does not
/// lead with the `0xFF` terminator. Displays echo terminated frames at the
/// wrong rate as garbage that frequently starts with `0xFF`, so this exact
/// test is kept for peer compatibility.
pub fn is_probe_hit(window: &[u8]) -> bool {
    window
        .first()
        .is_some_and(|byte| *byte != COMMAND_TERMINATOR)
}
