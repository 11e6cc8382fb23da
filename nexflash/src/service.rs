//! Background upload orchestration.
//!
//! The prepare sequence takes many seconds (multi-attempt handshake with
//! two-second settle delays), so interface handlers start it as an explicit
//! background task instead of blocking on it. [`UploadTask`] owns the
//! thread handle, the cancellation token and the shared session record; the
//! serial port moves into the task and comes back through [`UploadTask::join`]
//! once the handshake settles, which makes overlapping channel use
//! impossible by construction.
//!
//! ## Example
//!
//! ```rust,no_run
//! use nexflash::{NativePort, UploadConfig, UploadTask};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let firmware = std::fs::read("ui.tft")?;
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!
//!     let task = UploadTask::start(port, UploadConfig::default(), firmware.len() as u64);
//!     while !task.is_finished() {
//!         let status = task.status();
//!         eprintln!("prepare: {:?}/{:?}", status.prepare, status.upgrade);
//!         std::thread::sleep(std::time::Duration::from_millis(200));
//!     }
//!
//!     let mut uploader = task.join()?;
//!     for packet in firmware.chunks(nexflash::protocol::MAX_PACKET_SIZE) {
//!         uploader.send_packet(packet)?;
//!     }
//!     uploader.finish()?;
//!     Ok(())
//! }
//! ```

use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::CancelToken;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::session::{SessionHandle, SessionState};
use crate::uploader::{UploadConfig, Uploader};

/// A prepare sequence running on a background thread.
///
/// The task always hands the engine back: on success the returned
/// [`Uploader`] is ready for packet transfer at the negotiated rate, on
/// failure the error that ended the sequence surfaces from [`join`].
/// A panicking task surfaces as an error too, never as silent death.
///
/// [`join`]: UploadTask::join
pub struct UploadTask<P: Port + 'static> {
    session: SessionHandle,
    cancel: CancelToken,
    handle: Option<JoinHandle<(Uploader<P>, Result<()>)>>,
}

impl<P: Port + 'static> UploadTask<P> {
    /// Start a new upload: reset the session record and run the prepare
    /// sequence for an image of `expected_file_size` bytes in the
    /// background.
    ///
    /// The port moves into the task; only one task can drive a given
    /// channel at a time.
    pub fn start(port: P, config: UploadConfig, expected_file_size: u64) -> Self {
        let mut uploader = Uploader::with_config(port, config);
        let session = uploader.session();
        let cancel = uploader.cancel_token();

        let spawned = thread::Builder::new()
            .name("nexflash-prepare".into())
            .spawn(move || {
                let result = uploader.prepare(expected_file_size);
                if let Err(ref err) = result {
                    debug!("Prepare task finished with error: {err}");
                }
                (uploader, result)
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("Failed to spawn prepare thread: {err}");
                session.fail_prepare();
                None
            },
        };

        Self {
            session,
            cancel,
            handle,
        }
    }

    /// Copy out the current session state.
    #[must_use]
    pub fn status(&self) -> SessionState {
        self.session.snapshot()
    }

    /// Handle for polling session progress from yet another context.
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Token for cancelling the prepare sequence cooperatively.
    ///
    /// Cancellation is honored at every wait and settle boundary; the task
    /// leaves the channel drained at the fallback rate before finishing.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the background thread has finished (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the prepare sequence and take the engine back.
    ///
    /// Blocks until the background thread finishes, then returns the
    /// uploader ready for packet transfer, or the error that ended the
    /// sequence.
    pub fn join(mut self) -> Result<Uploader<P>> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| Error::Protocol("prepare task is not running".into()))?;

        let (uploader, result) = handle
            .join()
            .map_err(|_| Error::Protocol("prepare task panicked".into()))?;

        result.map(|()| uploader)
    }
}
