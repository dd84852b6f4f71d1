//! Handshake protocol between launcher and worker.
//!
//! This module defines everything that crosses the process boundary
//! before a worker is ready. Application messages exchanged after that
//! are layered by collaborators and not described here.
//!
//! # Protocol Overview
//!
//! | Step | Launcher sends | Worker replies |
//! |------|----------------|----------------|
//! | Bind | `bind` + [`StartParams`] | `bound` |
//! | Setup | `setup` + [`SetupBundle`] | `connected { pid }` |
//! | Teardown | `shutdown` / `crash` | (exits) |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `bundle` | Start parameters and setup bundle |
//! | `files` | Transferred file handles |
//! | `message` | Tagged handshake messages and the line codec |

// ============================================================================
// Submodules
// ============================================================================

/// Start parameters and setup bundle.
pub mod bundle;

/// Transferred file handles.
pub mod files;

/// Handshake messages.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use bundle::{BindingStrength, Extras, SetupBundle, StartParams};
pub use files::{FileDescriptor, FileHandle, FileHandleInfo, FileHandleSet, RawHandle, WHOLE_FILE};
pub use message::{HostMessage, WorkerMessage, decode_line, encode_line};
