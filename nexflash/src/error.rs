//! Error types for nexflash.

use std::io;
use thiserror::Error;

/// Result type for nexflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for nexflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No candidate baud rate produced a valid response from the display.
    #[error("Baud discovery failed: no candidate rate produced a response")]
    DiscoveryFailed,

    /// The display answered a prepare-phase command with an error byte.
    #[error("Display rejected the upload handshake")]
    PeerRejected,

    /// No handshake response arrived within the wait budget.
    #[error("Handshake timed out waiting for the display")]
    HandshakeTimeout,

    /// Fewer bytes were written to the channel than requested.
    #[error("Short write: {written} of {expected} bytes reached the channel")]
    ShortWrite {
        /// Bytes actually written.
        written: usize,
        /// Bytes that should have been written.
        expected: usize,
    },

    /// The display answered a fully-written packet with an error byte.
    #[error("Display rejected the packet")]
    TransferRejected,

    /// No packet acknowledgement arrived within the wait budget.
    #[error("Packet transfer timed out waiting for acknowledgement")]
    TransferTimeout,

    /// The operation was cancelled cooperatively.
    #[error("Operation cancelled")]
    Cancelled,

    /// Device not found during port discovery.
    #[error("Device not found")]
    DeviceNotFound,

    /// Protocol misuse or unexpected peer behavior.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
