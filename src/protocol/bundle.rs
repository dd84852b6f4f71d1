//! Bind parameters and the setup bundle.
//!
//! [`StartParams`] travel with the bind step, [`SetupBundle`] with the
//! setup step. The setup bundle is the whole contract between launcher and
//! worker: a command line and a set of file descriptors. Collaborators may
//! layer more data into `extras`; this crate never reads it.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identifiers::{CallerId, Pid};

use super::files::FileDescriptor;

// ============================================================================
// Types
// ============================================================================

/// Free-form key/value payload owned by collaborators.
pub type Extras = Map<String, Value>;

// ============================================================================
// BindingStrength
// ============================================================================

/// Reclamation priority hint passed to the platform at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingStrength {
    /// Keep the worker alive as long as the launcher is.
    Strong,
    /// Worker may be reclaimed under memory pressure.
    #[default]
    Moderate,
}

impl BindingStrength {
    /// Returns the strength for a `use_strong_binding` flag.
    #[inline]
    #[must_use]
    pub const fn from_strong(strong: bool) -> Self {
        if strong { Self::Strong } else { Self::Moderate }
    }

    /// Returns `true` for [`BindingStrength::Strong`].
    #[inline]
    #[must_use]
    pub const fn is_strong(self) -> bool {
        matches!(self, Self::Strong)
    }
}

// ============================================================================
// StartParams
// ============================================================================

/// Parameters delivered to the worker's `on_service_bound`.
///
/// # Format
///
/// ```json
/// {
///   "caller": "uuid",
///   "bindToCaller": true,
///   "binding": "moderate",
///   "hostPid": 4242,
///   "extras": { ... }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    /// Identity of the binding launcher.
    pub caller: CallerId,

    /// Whether the worker must latch `caller` and reject other callers.
    #[serde(default)]
    pub bind_to_caller: bool,

    /// Binding strength requested at bind time.
    #[serde(default)]
    pub binding: BindingStrength,

    /// Launcher process id, used to reopen transferred handles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_pid: Option<Pid>,

    /// Data added by `on_before_connection_allocated`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Extras,
}

impl StartParams {
    /// Creates start parameters for the given caller.
    #[must_use]
    pub fn new(caller: CallerId) -> Self {
        Self {
            caller,
            bind_to_caller: false,
            binding: BindingStrength::default(),
            host_pid: Pid::current(),
            extras: Extras::new(),
        }
    }
}

// ============================================================================
// SetupBundle
// ============================================================================

/// Configuration delivered to the worker's `on_connection_setup`.
///
/// # Format
///
/// ```json
/// {
///   "commandLine": ["--type=renderer", "--lang=en"],
///   "files": [{ "id": 3, "raw": 17, "offset": 0, "size": -1 }]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupBundle {
    /// Worker command line.
    pub command_line: Vec<String>,

    /// Transferred file handles.
    #[serde(default)]
    pub files: Vec<FileDescriptor>,

    /// Data added by `on_before_connection_setup`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Extras,
}

impl SetupBundle {
    /// Creates a bundle from a command line and file descriptors.
    #[must_use]
    pub fn new(command_line: Vec<String>, files: Vec<FileDescriptor>) -> Self {
        Self {
            command_line,
            files,
            extras: Extras::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_strength_from_flag() {
        assert_eq!(BindingStrength::from_strong(true), BindingStrength::Strong);
        assert_eq!(BindingStrength::from_strong(false), BindingStrength::Moderate);
        assert!(BindingStrength::Strong.is_strong());
    }

    #[test]
    fn test_setup_bundle_uses_camel_case() {
        let bundle = SetupBundle::new(vec!["--type=gpu".to_string()], Vec::new());
        let json = serde_json::to_string(&bundle).expect("serialize");
        assert!(json.contains("commandLine"));
        assert!(!json.contains("extras"));
    }

    #[test]
    fn test_setup_bundle_requires_command_line() {
        let result = serde_json::from_str::<SetupBundle>(r#"{"files": []}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_start_params_defaults() {
        let json = format!(r#"{{"caller": "{}"}}"#, uuid::Uuid::nil());
        let params: StartParams = serde_json::from_str(&json).expect("parse");
        assert!(!params.bind_to_caller);
        assert_eq!(params.binding, BindingStrength::Moderate);
        assert!(params.host_pid.is_none());
        assert!(params.extras.is_empty());
    }
}
