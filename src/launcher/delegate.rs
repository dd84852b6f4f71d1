//! Host-side launch delegate.

// ============================================================================
// Imports
// ============================================================================

use crate::identifiers::SlotIndex;
use crate::protocol::{SetupBundle, StartParams};
use crate::transport::SlotInfo;

use super::request::LaunchFailure;

// ============================================================================
// LaunchDelegate
// ============================================================================

/// Per-launch callbacks, invoked on the launcher task.
///
/// Every method has a no-op default. Callbacks must not block: they run
/// on the task that drives every other launch.
pub trait LaunchDelegate: Send + 'static {
    /// Picks a pre-warmed connection to reuse instead of allocating.
    ///
    /// `spares` lists the idle connections created by
    /// [`Launcher::warm_up`](super::Launcher::warm_up). Defaults to the
    /// oldest one.
    fn get_existing_connection(&mut self, spares: &[SlotInfo]) -> Option<SlotIndex> {
        spares.first().map(|slot| slot.index)
    }

    /// Adjusts the bind parameters of a freshly allocated connection.
    fn on_before_connection_allocated(&mut self, _params: &mut StartParams) {}

    /// The worker accepted the bind.
    fn on_connection_bound(&mut self, _slot: &SlotInfo) {}

    /// Adds collaborator data to the setup bundle.
    fn on_before_connection_setup(&mut self, _slot: &SlotInfo, _bundle: &mut SetupBundle) {}

    /// The worker acknowledged setup; its pid is now registered.
    fn on_connection_established(&mut self, _slot: &SlotInfo) {}

    /// The connection was stopped or died after becoming ready.
    fn on_connection_lost(&mut self, _slot: &SlotInfo) {}

    /// The launch ended without a ready connection.
    fn on_launch_failed(&mut self, _failure: &LaunchFailure) {}
}

/// Delegate that accepts every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl LaunchDelegate for NoopDelegate {}
