//! Error types for the worker launcher.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use worker_launcher::{Launcher, LaunchOptions, Result};
//!
//! async fn example(launcher: &Launcher) -> Result<()> {
//!     let handle = launcher.launch(LaunchOptions::new(["--type=renderer"])).await?;
//!     let pid = handle.wait_ready().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidArgument`] |
//! | Allocation | [`Error::NoCapacity`] |
//! | Binding | [`Error::BindFailed`], [`Error::SpawnFailed`] |
//! | Handshake | [`Error::SetupFailed`], [`Error::Protocol`] |
//! | Lifecycle | [`Error::LaunchFailed`], [`Error::InvalidState`], [`Error::LaunchNotFound`], [`Error::LauncherClosed`] |
//! | Worker protocol | [`Error::AlreadyBound`], [`Error::CallerMismatch`] |
//! | External | [`Error::Io`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::{CallerId, LaunchId, SlotIndex};
use crate::launcher::LaunchFailure;
use crate::transport::SlotState;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when launcher configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Allocation Errors
    // ========================================================================
    /// Every slot of a fixed pool is busy and the caller did not ask to queue.
    #[error("No free worker connection (capacity {capacity})")]
    NoCapacity {
        /// Pool capacity at the time of the request.
        capacity: usize,
    },

    // ========================================================================
    // Binding Errors
    // ========================================================================
    /// The platform refused to create or bind the worker.
    #[error("Failed to bind {slot}: {message}")]
    BindFailed {
        /// Slot that failed to bind.
        slot: SlotIndex,
        /// Description of the failure.
        message: String,
    },

    /// Failed to spawn a worker process.
    #[error("Failed to spawn worker: {message}")]
    SpawnFailed {
        /// Description of the spawn failure.
        message: String,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// The worker did not acknowledge setup.
    #[error("Connection setup failed on {slot}: {message}")]
    SetupFailed {
        /// Slot being set up.
        slot: SlotIndex,
        /// Description of the failure.
        message: String,
    },

    /// Protocol violation or unexpected message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// A launch request ended without reaching the ready state.
    #[error("Launch {launch_id} failed: {failure}")]
    LaunchFailed {
        /// The failed request.
        launch_id: LaunchId,
        /// Why it failed.
        failure: LaunchFailure,
    },

    /// An operation was attempted in the wrong slot state.
    #[error("Invalid state for {slot}: {operation} not allowed in {state:?}")]
    InvalidState {
        /// Slot the operation targeted.
        slot: SlotIndex,
        /// Current slot state.
        state: SlotState,
        /// Attempted operation.
        operation: &'static str,
    },

    /// Launch request is not known to the launcher.
    #[error("Launch not found: {launch_id}")]
    LaunchNotFound {
        /// The missing launch id.
        launch_id: LaunchId,
    },

    /// The launcher task has shut down.
    #[error("Launcher closed")]
    LauncherClosed,

    // ========================================================================
    // Worker Protocol Errors
    // ========================================================================
    /// `on_service_bound` was delivered twice to one worker.
    #[error("Worker service already bound")]
    AlreadyBound,

    /// Setup arrived from a caller other than the latched one.
    #[error("Caller mismatch: bound to {expected}, setup from {actual}")]
    CallerMismatch {
        /// Latched caller identity.
        expected: CallerId,
        /// Identity presented with the setup call.
        actual: CallerId,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a no capacity error.
    #[inline]
    pub fn no_capacity(capacity: usize) -> Self {
        Self::NoCapacity { capacity }
    }

    /// Creates a bind failed error.
    #[inline]
    pub fn bind_failed(slot: SlotIndex, message: impl Into<String>) -> Self {
        Self::BindFailed {
            slot,
            message: message.into(),
        }
    }

    /// Creates a spawn failed error.
    #[inline]
    pub fn spawn_failed(err: IoError) -> Self {
        Self::SpawnFailed {
            message: err.to_string(),
        }
    }

    /// Creates a setup failed error.
    #[inline]
    pub fn setup_failed(slot: SlotIndex, message: impl Into<String>) -> Self {
        Self::SetupFailed {
            slot,
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a launch failed error.
    #[inline]
    pub fn launch_failed(launch_id: LaunchId, failure: LaunchFailure) -> Self {
        Self::LaunchFailed { launch_id, failure }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(slot: SlotIndex, state: SlotState, operation: &'static str) -> Self {
        Self::InvalidState {
            slot,
            state,
            operation,
        }
    }

    /// Creates a launch not found error.
    #[inline]
    pub fn launch_not_found(launch_id: LaunchId) -> Self {
        Self::LaunchNotFound { launch_id }
    }

    /// Creates a caller mismatch error.
    #[inline]
    pub fn caller_mismatch(expected: CallerId, actual: CallerId) -> Self {
        Self::CallerMismatch { expected, actual }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if a launch ended because its worker missed the
    /// setup deadline.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::LaunchFailed {
                failure: LaunchFailure::SetupTimedOut { .. },
                ..
            }
        )
    }

    /// Returns `true` if retrying the launch may succeed.
    ///
    /// Exhaustion, bind failures and setup timeouts are transient.
    /// Protocol violations are not.
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoCapacity { .. } | Self::BindFailed { .. } | Self::SpawnFailed { .. }
        ) || self.is_timeout()
    }

    /// Returns `true` if this is a fatal worker configuration error.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AlreadyBound | Self::CallerMismatch { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::no_capacity(4);
        assert_eq!(err.to_string(), "No free worker connection (capacity 4)");
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("capacity must be positive");
        assert_eq!(err.to_string(), "Configuration error: capacity must be positive");
    }

    #[test]
    fn test_bind_failed_display() {
        let err = Error::bind_failed(SlotIndex::new(2), "refused");
        assert_eq!(err.to_string(), "Failed to bind slot#2: refused");
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::no_capacity(1).is_transient());
        assert!(Error::bind_failed(SlotIndex::new(0), "x").is_transient());
        assert!(!Error::AlreadyBound.is_transient());
    }

    #[test]
    fn test_is_fatal() {
        let a = CallerId::generate();
        let b = CallerId::generate();
        assert!(Error::caller_mismatch(a, b).is_fatal());
        assert!(Error::AlreadyBound.is_fatal());
        assert!(!Error::LauncherClosed.is_fatal());
    }

    #[test]
    fn test_is_timeout() {
        let timed_out =
            Error::launch_failed(LaunchId::next(), LaunchFailure::SetupTimedOut { after_ms: 100 });
        assert!(timed_out.is_timeout());
        assert!(timed_out.is_transient());

        let rejected = Error::launch_failed(
            LaunchId::next(),
            LaunchFailure::SetupFailed {
                reason: "bad".into(),
            },
        );
        assert!(!rejected.is_timeout());
        assert!(!Error::protocol("bad").is_timeout());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
