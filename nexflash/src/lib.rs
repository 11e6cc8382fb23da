//! # nexflash
//!
//! A library for uploading firmware to Nextion-compatible serial displays.
//!
//! This crate implements the display's native upload protocol over a
//! serial port:
//!
//! - Baud-rate discovery against the candidate rate list
//! - The multi-attempt prepare sequence (reset, two-sided baud
//!   negotiation, `whmi-wri` announce)
//! - Chunked packet transfer with per-packet acknowledgement and retry
//! - A shared session record for progress/outcome polling
//!
//! ## Example
//!
//! ```rust,no_run
//! use nexflash::{NativePort, UploadConfig, UploadTask, protocol::MAX_PACKET_SIZE};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let firmware = std::fs::read("ui.tft")?;
//!
//!     // Open the port at the factory-default rate; the prepare sequence
//!     // negotiates the transfer speed itself.
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!
//!     // Prepare runs in the background; poll `status()` for progress.
//!     let task = UploadTask::start(port, UploadConfig::default(), firmware.len() as u64);
//!     let mut uploader = task.join()?;
//!
//!     for packet in firmware.chunks(MAX_PACKET_SIZE) {
//!         uploader.send_packet(packet)?;
//!     }
//!     uploader.finish()?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod device;
pub mod error;
pub mod monitor;
pub mod port;
pub mod protocol;
pub mod service;
pub mod session;
pub mod uploader;

/// Shared flag for cancelling long-running engine loops cooperatively.
///
/// Cloning the token shares the flag. The engine checks it at every wait
/// and settle boundary; a set flag surfaces as [`Error::Cancelled`]
/// (mid-step cancellation is not attempted, the link would be left in an
/// unknown state).
///
/// [`Error::Cancelled`]: crate::error::Error::Cancelled
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

// Re-exports for convenience
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, find_port_by_pattern},
    error::{Error, Result},
    monitor::{MonitorSession, clean_monitor_text, drain_utf8_lossy},
    port::{NativePort, NativePortEnumerator, Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::command::{Command, Response},
    service::UploadTask,
    session::{PrepareState, SessionHandle, SessionState, UpgradeState},
    uploader::{UploadConfig, Uploader},
};
