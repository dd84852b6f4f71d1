//! Host-side launcher.
//!
//! The [`Launcher`] turns [`LaunchOptions`] into ready workers. It owns the
//! connection allocator, one state machine per launch, and the registry of
//! ready pids, all on a single tokio task.
//!
//! # Launch Flow
//!
//! 1. `Launcher::launch` - Reuse a spare or allocate a connection (or queue)
//! 2. Bind - The platform creates the worker; failures retry on a fresh slot
//! 3. Setup - Command line, files and delegate extras go to the worker
//! 4. Ready - The pid is registered and the caller's files are closed
//! 5. `LaunchHandle::stop` or worker death - Connection freed, queued launches retried
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | Launcher task, [`Launcher`] and [`LaunchHandle`] |
//! | `request` | Per-launch state machine and [`LaunchOptions`] |
//! | `delegate` | [`LaunchDelegate`] callbacks |
//! | `registry` | Pid to launch map |

// ============================================================================
// Submodules
// ============================================================================

/// Launcher task and handles.
pub mod core;

/// Launch delegate callbacks.
pub mod delegate;

/// Pid registry.
pub mod registry;

/// Launch request state machine.
pub mod request;


// ============================================================================
// Re-exports
// ============================================================================

pub use core::{LaunchHandle, Launcher, LauncherStats};
pub use delegate::{LaunchDelegate, NoopDelegate};
pub use registry::ProcessRegistry;
pub use request::{LaunchFailure, LaunchOptions, LaunchState};
