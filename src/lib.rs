//! Worker Launcher - Bounded pool manager for out-of-process worker services.
//!
//! This library launches helper worker processes, binds each one to a
//! connection slot from a bounded (or on-demand) pool, runs a two-step
//! handshake, and tears workers down when they stop or die.
//!
//! # Architecture
//!
//! The launcher follows a host/worker model:
//!
//! - **Host (launcher)**: Allocates slots, binds workers, sends setup, tracks pids
//! - **Worker (service)**: Accepts one bind and one setup, then runs its main loop
//!
//! Key design principles:
//!
//! - One tokio task owns the allocator, every launch request and the pid registry
//! - Each connection slot runs its own transport task and reports tagged events
//! - Freed slots return to the pool after a grace period, then queued launches retry in order
//! - Transferred file handles are closed exactly once, whatever the outcome
//!
//! # Quick Start
//!
//! ```no_run
//! use worker_launcher::{LaunchOptions, Launcher, ProcessSpawner, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let launcher = Launcher::builder()
//!         .spawner(ProcessSpawner::new("/path/to/worker")?)
//!         .capacity(4)
//!         .build()?;
//!
//!     let handle = launcher
//!         .launch(LaunchOptions::new(["--type=renderer"]).queue_if_no_free_connection())
//!         .await?;
//!     let pid = handle.wait_ready().await?;
//!     println!("Worker ready: {pid}");
//!
//!     handle.stop().await?;
//!     launcher.shutdown().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`launcher`] | [`Launcher`], [`LaunchHandle`] and the launch state machine |
//! | [`allocator`] | Connection slot pool |
//! | [`config`] | [`LauncherConfig`] and [`LauncherBuilder`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Handshake messages, start parameters and file handles |
//! | [`transport`] | Connection slots and worker spawners |
//! | [`worker`] | Worker-side service and delegate |

// ============================================================================
// Modules
// ============================================================================

/// Connection slot pool.
pub mod allocator;

/// Launcher configuration and builder.
///
/// Use [`Launcher::builder()`] to create a configured launcher.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Host-side launcher.
///
/// - [`Launcher`] - Owns the pool and every launch
/// - [`LaunchHandle`] - Caller's view of one launch
/// - [`LaunchDelegate`] - Launch callbacks
pub mod launcher;

/// Handshake protocol types.
pub mod protocol;

/// Worker transport layer.
///
/// Slot state machine, per-slot event loop and worker spawners.
pub mod transport;

/// Worker-side service.
pub mod worker;

// ============================================================================
// Re-exports
// ============================================================================

// Launcher types
pub use launcher::{
    LaunchDelegate, LaunchFailure, LaunchHandle, LaunchOptions, LaunchState, Launcher,
    LauncherStats, NoopDelegate,
};

// Configuration types
pub use allocator::{Capacity, ConnectionAllocator};
pub use config::{LauncherBuilder, LauncherConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CallerId, LaunchId, ListenerId, Pid, SlotIndex};

// Protocol types
pub use protocol::{
    BindingStrength, FileHandle, FileHandleInfo, FileHandleSet, HostMessage, SetupBundle,
    StartParams, WorkerMessage,
};

// Transport types
pub use transport::{ChildChannel, ChildSpawner, ProcessSpawner, SlotInfo, SlotState};

// Worker types
pub use worker::{HostContext, WorkerExit, WorkerService, WorkerServiceDelegate};
