//! Platform binding seam.
//!
//! A [`ChildSpawner`] creates the worker and returns a [`ChildChannel`]
//! the slot event loop uses to run the handshake. Creating the channel is
//! the "bind" step; the worker's `bound` reply completes it.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::error::Result;
use crate::identifiers::SlotIndex;
use crate::protocol::{BindingStrength, HostMessage, WorkerMessage};

// ============================================================================
// SpawnRequest
// ============================================================================

/// What the launcher asks of the platform when binding a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Slot being bound.
    pub slot: SlotIndex,
    /// Requested binding strength.
    pub binding: BindingStrength,
}

// ============================================================================
// ChildSpawner
// ============================================================================

/// Creates worker endpoints.
#[async_trait]
pub trait ChildSpawner: Send + Sync + 'static {
    /// Creates a worker and returns the channel to it.
    ///
    /// # Errors
    ///
    /// Any error is reported to the launch request as a bind failure.
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn ChildChannel>>;
}

// ============================================================================
// ChildChannel
// ============================================================================

/// Bidirectional handshake channel to one worker.
///
/// `recv` must be cancel-safe: the slot event loop drops it whenever a
/// launcher command arrives first.
#[async_trait]
pub trait ChildChannel: Send + 'static {
    /// Sends one message to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker can no longer be reached.
    async fn send(&mut self, message: &HostMessage) -> Result<()>;

    /// Receives the next message. `None` means the worker is gone.
    async fn recv(&mut self) -> Option<Result<WorkerMessage>>;

    /// Terminates the worker and waits for it to exit.
    async fn kill(&mut self);

    /// OS-level id of the worker, when known before the handshake.
    fn os_pid(&self) -> Option<u32> {
        None
    }
}
