//! Worker side of the launch handshake.
//!
//! A worker executable wraps its behaviour in a [`WorkerServiceDelegate`]
//! and hands it to a [`WorkerService`]:
//!
//! ```ignore
//! use worker_launcher::worker::{HostContext, WorkerService, WorkerServiceDelegate};
//!
//! struct Renderer;
//!
//! impl WorkerServiceDelegate for Renderer {
//!     fn load_runtime(&self, context: &HostContext) -> bool {
//!         context.has_switch("--type")
//!     }
//!
//!     fn run_main(&self) {
//!         // ...
//!     }
//! }
//!
//! fn main() {
//!     WorkerService::new(Renderer).serve_stdio().exit_process();
//! }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Delegate trait and host context.
pub mod delegate;

/// Handshake state machine and IPC loop.
pub mod service;

// ============================================================================
// Re-exports
// ============================================================================

pub use delegate::{HostContext, ReceivedFile, WorkerServiceDelegate};
pub use service::{Reply, WorkerExit, WorkerService};
