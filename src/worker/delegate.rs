//! Worker-side delegate and the context handed to it.

// ============================================================================
// Imports
// ============================================================================

use std::fs::File;

use crate::protocol::{Extras, FileDescriptor, StartParams};

// ============================================================================
// ReceivedFile
// ============================================================================

/// A file handle as seen by the worker.
#[derive(Debug)]
pub struct ReceivedFile {
    /// Wire descriptor sent by the launcher.
    pub descriptor: FileDescriptor,
    /// The worker's own copy, if it could be reopened.
    pub file: Option<File>,
}

// ============================================================================
// HostContext
// ============================================================================

/// Everything the launcher delivered during bind and setup.
#[derive(Debug)]
pub struct HostContext {
    /// Parameters from the bind step.
    pub params: StartParams,
    /// Worker command line.
    pub command_line: Vec<String>,
    /// Transferred files.
    pub files: Vec<ReceivedFile>,
    /// Collaborator payload from the setup step.
    pub extras: Extras,
}

impl HostContext {
    /// Looks up a transferred file by id.
    #[must_use]
    pub fn file(&self, id: u32) -> Option<&ReceivedFile> {
        self.files.iter().find(|f| f.descriptor.id == id)
    }

    /// Returns `true` if the command line contains `switch`.
    #[must_use]
    pub fn has_switch(&self, switch: &str) -> bool {
        self.command_line
            .iter()
            .any(|arg| arg == switch || arg.strip_prefix(switch).is_some_and(|r| r.starts_with('=')))
    }
}

// ============================================================================
// WorkerServiceDelegate
// ============================================================================

/// Worker behaviour plugged into a [`WorkerService`](super::WorkerService).
///
/// Callbacks arrive in this order: `on_service_bound`,
/// `on_connection_setup` (IPC thread), then `load_runtime`,
/// `on_before_main`, `run_main` (main thread), and finally `on_destroy`.
pub trait WorkerServiceDelegate: Send + Sync + 'static {
    /// Bind parameters arrived.
    fn on_service_bound(&self, _params: &StartParams) {}

    /// Setup bundle arrived. Runs on the IPC thread, before the
    /// acknowledgement is sent.
    fn on_connection_setup(&self, _context: &HostContext) {}

    /// Loads the worker runtime. Returning `false` terminates the worker.
    fn load_runtime(&self, context: &HostContext) -> bool;

    /// Called after the runtime loaded, right before `run_main`.
    fn on_before_main(&self) {}

    /// The worker's blocking run loop. Returning ends the worker.
    fn run_main(&self);

    /// Teardown. Never runs before `load_runtime` has returned.
    fn on_destroy(&self) {}
}

// ============================================================================
// Tests
// ============================================================================
