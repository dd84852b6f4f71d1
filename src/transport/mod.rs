//! Worker transport layer.
//!
//! This module owns the launcher side of each worker connection: the
//! slot state machine, the per-slot event loop, and the platform seam
//! that actually creates workers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   SlotCommand    ┌──────────────┐   HostMessage   ┌──────────┐
//! │ Launcher task    │─────────────────►│ Slot task    │────────────────►│  Worker  │
//! │ (ConnectionSlot) │◄─────────────────│ (run_slot)   │◄────────────────│          │
//! └──────────────────┘ SlotNotification └──────────────┘  WorkerMessage  └──────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `ConnectionSlot::start` - Spawn the worker and send `bind`
//! 2. `SlotEvent::Started` - Worker replied `bound`
//! 3. `ConnectionSlot::setup` - Send the setup bundle
//! 4. `SlotEvent::Connected` - Worker replied with its pid
//! 5. `ConnectionSlot::stop` - Send `shutdown`, kill the worker if it outlives the grace period
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `slot` | Connection slot state machine and event loop |
//! | `spawner` | Platform binding traits |
//! | `process` | Child-process spawner over stdio |
//! | `memory` | In-process spawner for tests |

// ============================================================================
// Submodules
// ============================================================================

/// Connection slots and their event loop.
pub mod slot;

/// Platform binding traits.
pub mod spawner;

/// Child-process transport.
pub mod process;

/// In-process transport for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod memory;

// ============================================================================
// Re-exports
// ============================================================================

pub use process::ProcessSpawner;
pub use slot::{
    ConnectionSlot, SlotEvent, SlotEventSink, SlotInfo, SlotKey, SlotNotification, SlotState,
    SlotTimeouts,
};
pub use spawner::{ChildChannel, ChildSpawner, SpawnRequest};

#[cfg(any(test, feature = "test-support"))]
pub use memory::{FakeWorker, MemorySpawner};
