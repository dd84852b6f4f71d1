//! Handshake messages exchanged between launcher and worker.
//!
//! Messages are JSON objects tagged by `type`, one per line.
//!
//! | Direction | Message | Meaning |
//! |-----------|---------|---------|
//! | Launcher → Worker | `bind` | Deliver [`StartParams`] (`on_service_bound`) |
//! | Launcher → Worker | `setup` | Deliver [`SetupBundle`] (`on_connection_setup`) |
//! | Launcher → Worker | `update_binding` | Binding strength changed |
//! | Launcher → Worker | `crash` | Terminate abnormally (testing hook) |
//! | Launcher → Worker | `shutdown` | Terminate normally |
//! | Worker → Launcher | `bound` | Bind accepted |
//! | Worker → Launcher | `connected` | Setup accepted, carries the worker pid |
//! | Worker → Launcher | `rejected` | Bind or setup refused |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::{CallerId, Pid};

use super::bundle::{BindingStrength, SetupBundle, StartParams};

// ============================================================================
// HostMessage
// ============================================================================

/// Message from launcher to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Bind the service.
    Bind {
        /// Start parameters.
        params: StartParams,
    },

    /// Set up the connection.
    Setup {
        /// Identity presented with the setup call.
        caller: CallerId,
        /// Command line and files.
        bundle: SetupBundle,
    },

    /// Binding strength changed.
    UpdateBinding {
        /// New strength.
        strength: BindingStrength,
    },

    /// Terminate abnormally.
    Crash,

    /// Terminate normally.
    Shutdown,
}

impl HostMessage {
    /// Returns the wire name of the message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Setup { .. } => "setup",
            Self::UpdateBinding { .. } => "update_binding",
            Self::Crash => "crash",
            Self::Shutdown => "shutdown",
        }
    }
}

// ============================================================================
// WorkerMessage
// ============================================================================

/// Message from worker to launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Bind accepted.
    Bound,

    /// Setup accepted.
    Connected {
        /// Worker process id.
        pid: Pid,
    },

    /// Bind or setup refused.
    Rejected {
        /// Why the worker refused.
        reason: String,
    },
}

// ============================================================================
// Line Codec
// ============================================================================

/// Encodes a message as a single JSON line, newline included.
///
/// # Errors
///
/// Returns [`Error::Json`] if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one JSON line.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for blank lines and [`Error::Json`] for
/// malformed ones.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Error::protocol("empty handshake line"));
    }
    Ok(serde_json::from_str(trimmed)?)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_message_tagging() {
        let line = encode_line(&HostMessage::Crash).expect("encode");
        assert_eq!(line, "{\"type\":\"crash\"}\n");

        let line = encode_line(&HostMessage::UpdateBinding {
            strength: BindingStrength::Strong,
        })
        .expect("encode");
        assert!(line.contains("\"type\":\"update_binding\""));
        assert!(line.contains("\"strength\":\"strong\""));
    }

    #[test]
    fn test_setup_message_parses() {
        let json = format!(
            r#"{{"type":"setup","caller":"{}","bundle":{{"commandLine":["--a"],"files":[]}}}}"#,
            uuid::Uuid::nil()
        );
        let message: HostMessage = decode_line(&json).expect("decode");
        match message {
            HostMessage::Setup { bundle, .. } => assert_eq!(bundle.command_line, vec!["--a"]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_connected_parses() {
        let message: WorkerMessage =
            decode_line("{\"type\":\"connected\",\"pid\":77}\n").expect("decode");
        assert_eq!(
            message,
            WorkerMessage::Connected {
                pid: Pid::new(77).expect("non-zero")
            }
        );
    }

    #[test]
    fn test_connected_rejects_zero_pid() {
        let result = decode_line::<WorkerMessage>("{\"type\":\"connected\",\"pid\":0}");
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_blank_line_is_protocol_error() {
        let result = decode_line::<WorkerMessage>("   \n");
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(HostMessage::Shutdown.kind(), "shutdown");
        assert_eq!(HostMessage::Crash.kind(), "crash");
    }
}
