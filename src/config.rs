//! Launcher configuration and builder.
//!
//! [`LauncherConfig`] holds the tunables and can be loaded from JSON.
//! [`LauncherBuilder`] adds the platform spawner and validates everything
//! before starting the launcher task.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use worker_launcher::{Launcher, transport::ProcessSpawner};
//!
//! let launcher = Launcher::builder()
//!     .spawner(ProcessSpawner::new("/usr/lib/app/worker")?)
//!     .capacity(8)
//!     .free_delay(Duration::from_millis(1))
//!     .build()?;
//! ```
//!
//! # JSON Format
//!
//! ```json
//! {
//!   "capacity": { "fixed": 8 },
//!   "freeDelayMs": 1,
//!   "bindRetryLimit": 1,
//!   "bindTimeoutMs": 10000,
//!   "setupTimeoutMs": 10000,
//!   "shutdownGraceMs": 2000,
//!   "bindToCaller": false,
//!   "defaultBinding": "moderate"
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocator::Capacity;
use crate::error::{Error, Result};
use crate::identifiers::CallerId;
use crate::launcher::Launcher;
use crate::protocol::BindingStrength;
use crate::transport::{ChildSpawner, SlotTimeouts};

// ============================================================================
// Constants
// ============================================================================

/// Default grace period between free and reuse.
pub const DEFAULT_FREE_DELAY: Duration = Duration::from_millis(1);

/// Default number of bind retries per launch.
pub const DEFAULT_BIND_RETRY_LIMIT: u32 = 1;

/// Default deadline for each handshake step.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a stopped worker gets to exit before it is killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// LauncherConfig
// ============================================================================

/// Launcher tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LauncherConfig {
    /// Pool sizing policy.
    pub capacity: Capacity,

    /// Grace period between freeing a slot and reusing it.
    #[serde(rename = "freeDelayMs", with = "duration_ms")]
    pub free_delay: Duration,

    /// Bind attempts allowed after the first failure.
    pub bind_retry_limit: u32,

    /// Maximum time for the bind step.
    #[serde(rename = "bindTimeoutMs", with = "duration_ms")]
    pub bind_timeout: Duration,

    /// Maximum time for the setup step.
    #[serde(rename = "setupTimeoutMs", with = "duration_ms")]
    pub setup_timeout: Duration,

    /// Time a stopped worker gets to exit on its own before it is killed.
    #[serde(rename = "shutdownGraceMs", with = "duration_ms")]
    pub shutdown_grace: Duration,

    /// Whether workers must latch the launcher's caller identity.
    pub bind_to_caller: bool,

    /// Binding strength used unless a launch asks otherwise.
    pub default_binding: BindingStrength,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            capacity: Capacity::default(),
            free_delay: DEFAULT_FREE_DELAY,
            bind_retry_limit: DEFAULT_BIND_RETRY_LIMIT,
            bind_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            setup_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            bind_to_caller: false,
            default_binding: BindingStrength::default(),
        }
    }
}

impl LauncherConfig {
    /// Parses a configuration from JSON. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input and [`Error::Config`]
    /// if validation fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == Capacity::Fixed(0) {
            return Err(Error::config(
                "Fixed capacity must be at least 1. Use .on_demand() for an unbounded pool.",
            ));
        }
        if self.bind_timeout.is_zero() {
            return Err(Error::config("Bind timeout must be non-zero"));
        }
        if self.setup_timeout.is_zero() {
            return Err(Error::config("Setup timeout must be non-zero"));
        }
        Ok(())
    }

    /// Handshake deadlines handed to each slot.
    #[inline]
    #[must_use]
    pub fn timeouts(&self) -> SlotTimeouts {
        SlotTimeouts {
            bind: self.bind_timeout,
            setup: self.setup_timeout,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// LauncherBuilder
// ============================================================================

/// Builder for a [`Launcher`].
///
/// Use [`Launcher::builder()`] to create one.
#[derive(Default, Clone)]
pub struct LauncherBuilder {
    config: LauncherConfig,
    spawner: Option<Arc<dyn ChildSpawner>>,
    caller: Option<CallerId>,
}

impl fmt::Debug for LauncherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LauncherBuilder")
            .field("config", &self.config)
            .field("spawner", &self.spawner.is_some())
            .field("caller", &self.caller)
            .finish()
    }
}

impl LauncherBuilder {
    /// Creates a builder with default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: LauncherConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the platform spawner. Required.
    #[inline]
    #[must_use]
    pub fn spawner(mut self, spawner: impl ChildSpawner) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    /// Uses a fixed pool of `slots` connections.
    #[inline]
    #[must_use]
    pub fn capacity(mut self, slots: usize) -> Self {
        self.config.capacity = Capacity::Fixed(slots);
        self
    }

    /// Uses an unbounded pool.
    #[inline]
    #[must_use]
    pub fn on_demand(mut self) -> Self {
        self.config.capacity = Capacity::OnDemand;
        self
    }

    /// Sets the grace period between free and reuse. Zero is allowed.
    #[inline]
    #[must_use]
    pub fn free_delay(mut self, delay: Duration) -> Self {
        self.config.free_delay = delay;
        self
    }

    /// Sets how many times a failed bind is retried.
    #[inline]
    #[must_use]
    pub fn bind_retry_limit(mut self, retries: u32) -> Self {
        self.config.bind_retry_limit = retries;
        self
    }

    /// Sets the bind step deadline.
    #[inline]
    #[must_use]
    pub fn bind_timeout(mut self, timeout: Duration) -> Self {
        self.config.bind_timeout = timeout;
        self
    }

    /// Sets the setup step deadline.
    #[inline]
    #[must_use]
    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.config.setup_timeout = timeout;
        self
    }

    /// Sets how long a stopped worker may take to exit. Zero kills at once.
    #[inline]
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Requires workers to accept setup only from this launcher.
    #[inline]
    #[must_use]
    pub fn bind_to_caller(mut self) -> Self {
        self.config.bind_to_caller = true;
        self
    }

    /// Sets the binding strength used by default.
    #[inline]
    #[must_use]
    pub fn default_binding(mut self, strength: BindingStrength) -> Self {
        self.config.default_binding = strength;
        self
    }

    /// Sets the caller identity presented to workers.
    ///
    /// A random identity is generated if not set.
    #[inline]
    #[must_use]
    pub fn caller(mut self, caller: CallerId) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Validates the configuration and starts the launcher task.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no spawner is set
    /// - [`Error::Config`] if the configuration is invalid
    /// - [`Error::Config`] if called outside a tokio runtime
    pub fn build(self) -> Result<Launcher> {
        let spawner = self.spawner.ok_or_else(|| {
            Error::config(
                "A child spawner is required. Use .spawner() to set it.\n\
                 Example: Launcher::builder().spawner(ProcessSpawner::new(\"./worker\")?)",
            )
        })?;
        self.config.validate()?;

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::config("Launcher must be built inside a tokio runtime"));
        }

        let caller = self.caller.unwrap_or_else(CallerId::generate);
        Ok(Launcher::start(self.config, spawner, caller))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::MemorySpawner;

    #[test]
    fn test_defaults() {
        let config = LauncherConfig::default();
        assert_eq!(config.capacity, Capacity::Fixed(1));
        assert_eq!(config.free_delay, Duration::from_millis(1));
        assert_eq!(config.bind_retry_limit, 1);
        assert!(!config.bind_to_caller);
        assert_eq!(config.default_binding, BindingStrength::Moderate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = LauncherConfig::from_json(
            r#"{ "capacity": { "fixed": 4 }, "freeDelayMs": 0, "defaultBinding": "strong" }"#,
        )
        .expect("valid config");

        assert_eq!(config.capacity, Capacity::Fixed(4));
        assert_eq!(config.free_delay, Duration::ZERO);
        assert_eq!(config.default_binding, BindingStrength::Strong);
        assert_eq!(config.bind_retry_limit, DEFAULT_BIND_RETRY_LIMIT);
    }

    #[test]
    fn test_from_json_on_demand() {
        let config = LauncherConfig::from_json(r#"{ "capacity": "on_demand" }"#).expect("valid");
        assert_eq!(config.capacity, Capacity::OnDemand);
    }

    #[test]
    fn test_json_round_trip_shape() {
        let json = serde_json::to_value(LauncherConfig::default()).expect("serialize");
        assert_eq!(json["freeDelayMs"], 1);
        assert_eq!(json["bindTimeoutMs"], 10_000);
        assert_eq!(json["capacity"]["fixed"], 1);
        assert_eq!(json["shutdownGraceMs"], 2_000);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = LauncherConfig::from_json(r#"{ "capacity": { "fixed": 0 } }"#);
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = LauncherConfig {
            setup_timeout: Duration::ZERO,
            ..LauncherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_sets_fields() {
        let builder = LauncherBuilder::new()
            .capacity(3)
            .free_delay(Duration::ZERO)
            .bind_retry_limit(2)
            .shutdown_grace(Duration::ZERO)
            .bind_to_caller()
            .default_binding(BindingStrength::Strong);

        assert_eq!(builder.config.capacity, Capacity::Fixed(3));
        assert_eq!(builder.config.free_delay, Duration::ZERO);
        assert_eq!(builder.config.bind_retry_limit, 2);
        assert_eq!(builder.config.timeouts().shutdown_grace, Duration::ZERO);
        assert!(builder.config.bind_to_caller);
        assert_eq!(builder.config.default_binding, BindingStrength::Strong);
    }

    #[test]
    fn test_build_fails_without_spawner() {
        let err = LauncherBuilder::new().build().expect_err("spawner required");
        assert!(err.to_string().contains("spawner"));
    }

    #[test]
    fn test_build_fails_outside_runtime() {
        let result = LauncherBuilder::new().spawner(MemorySpawner::new()).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_build_with_zero_capacity_fails() {
        let result = LauncherBuilder::new()
            .spawner(MemorySpawner::new())
            .capacity(0)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_inside_runtime() {
        let launcher = LauncherBuilder::new()
            .spawner(MemorySpawner::new())
            .on_demand()
            .build()
            .expect("launcher");
        launcher.shutdown().await.expect("shutdown");
    }
}
