//! Shared upload session state.
//!
//! One [`SessionState`] record exists per upload. The prepare sequence and
//! the packet transfer loop are its only writers; any other context (a CLI
//! progress loop, an API handler) observes it through copied snapshots.
//! Transitions are published whole under a lock so a reader never sees a
//! half-updated record.

use std::sync::{Arc, Mutex, PoisonError};

/// Progress of the prepare sequence.
///
/// Monotonic within one session: `Idle` → `InProgress` → `Done` | `Error`,
/// terminal once `Done` or `Error`. A new session resets it to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrepareState {
    /// No prepare sequence has run yet.
    #[default]
    Idle,
    /// The prepare sequence is running.
    InProgress,
    /// The display acknowledged the handshake.
    Done,
    /// The prepare sequence failed.
    Error,
}

/// Overall progress of the upload.
///
/// `Idle` → `HandshakeSent` → `Ready` → `Transferring` → `Complete`, with
/// `Error` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UpgradeState {
    /// No upload in progress.
    #[default]
    Idle,
    /// The upload was requested; the handshake is being negotiated.
    HandshakeSent,
    /// The display acknowledged the handshake and awaits data.
    Ready,
    /// Firmware packets are being transferred.
    Transferring,
    /// Every announced byte was delivered and acknowledged.
    Complete,
    /// The upload failed.
    Error,
}

/// Status record for one upload session.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionState {
    /// Prepare sequence progress.
    pub prepare: PrepareState,
    /// Overall upload progress.
    pub upgrade: UpgradeState,
    /// Total image size announced to the display.
    pub expected_file_size: u64,
    /// Bytes delivered and acknowledged so far.
    pub total_received: u64,
    /// Size of the packet currently (or most recently) in flight.
    pub current_packet_size: u32,
}

impl SessionState {
    /// Whether the display is ready to receive packets.
    pub fn is_ready(&self) -> bool {
        matches!(self.upgrade, UpgradeState::Ready)
    }

    /// Whether the session reached a terminal outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self.upgrade, UpgradeState::Complete | UpgradeState::Error)
    }

    /// Delivered fraction of the announced image, in `0.0..=1.0`.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.expected_file_size == 0 {
            0.0
        } else {
            self.total_received as f64 / self.expected_file_size as f64
        }
    }
}

/// Synchronized handle publishing [`SessionState`] snapshots.
///
/// Cloning the handle shares the same record; `snapshot` copies it out so
/// callers never hold the lock across their own work.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    /// Create a handle over a fresh, idle session record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out the current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        *self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a transition as one atomic update.
    pub(crate) fn update(&self, apply: impl FnOnce(&mut SessionState)) {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        apply(&mut state);
    }

    /// Reset the record for a new upload of `expected_file_size` bytes.
    pub(crate) fn begin(&self, expected_file_size: u64) {
        self.update(|state| {
            *state = SessionState {
                prepare: PrepareState::InProgress,
                upgrade: UpgradeState::HandshakeSent,
                expected_file_size,
                total_received: 0,
                current_packet_size: 0,
            };
        });
    }

    /// Mark the prepare sequence (and the session) as failed.
    pub(crate) fn fail_prepare(&self) {
        self.update(|state| {
            state.prepare = PrepareState::Error;
            state.upgrade = UpgradeState::Error;
        });
    }
}
