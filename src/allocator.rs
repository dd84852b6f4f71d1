//! Connection allocator.
//!
//! Manages the pool of [`ConnectionSlot`]s. A fixed pool is created up
//! front and hands out the lowest free index first; an on-demand pool
//! grows whenever every existing slot is busy.
//!
//! Freeing is two-phase. [`ConnectionAllocator::free`] moves the slot to
//! `Freed` and returns the key the caller must pass to
//! [`ConnectionAllocator::complete_free`] once the grace period has
//! passed. Only then does the slot become allocatable again, and only
//! then are freed-listeners reported.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::identifiers::{LaunchId, ListenerId, SlotIndex};
use crate::transport::{ConnectionSlot, SlotKey, SlotState};

// ============================================================================
// Capacity
// ============================================================================

/// Pool sizing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    /// At most `n` slots.
    Fixed(usize),
    /// Grows without bound.
    OnDemand,
}

impl Capacity {
    /// Returns the slot limit, if any.
    #[inline]
    #[must_use]
    pub const fn limit(self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(n),
            Self::OnDemand => None,
        }
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::Fixed(1)
    }
}

// ============================================================================
// ConnectionAllocator
// ============================================================================

/// Pool of connection slots.
///
/// Owned by the launcher task; every method takes `&mut self` or `&self`
/// and never blocks.
#[derive(Debug)]
pub struct ConnectionAllocator {
    capacity: Capacity,
    slots: Vec<ConnectionSlot>,
    free_delay: Duration,
    listeners: Vec<(ListenerId, LaunchId)>,
    next_listener: u64,
}

impl ConnectionAllocator {
    /// Creates an allocator. Fixed pools create their slots immediately.
    #[must_use]
    pub fn new(capacity: Capacity, free_delay: Duration) -> Self {
        let slots = match capacity {
            Capacity::Fixed(n) => (0..n).map(|i| ConnectionSlot::new(SlotIndex::new(i))).collect(),
            Capacity::OnDemand => Vec::new(),
        };

        Self {
            capacity,
            slots,
            free_delay,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Hands out a free slot, assigned to `owner`.
    ///
    /// Returns `None` when a fixed pool is exhausted.
    pub fn allocate(&mut self, owner: Option<LaunchId>) -> Option<SlotIndex> {
        let position = match self.slots.iter().position(is_available) {
            Some(position) => position,
            None if self.capacity == Capacity::OnDemand => {
                self.slots.push(ConnectionSlot::new(SlotIndex::new(self.slots.len())));
                self.slots.len() - 1
            }
            None => {
                trace!(capacity = ?self.capacity, "No free connection");
                return None;
            }
        };

        let slot = &mut self.slots[position];
        slot.assign(owner);
        debug!(slot = %slot.index(), owner = ?owner, "Connection allocated");
        Some(slot.index())
    }

    /// Marks a slot for return to the pool.
    ///
    /// Stops the worker if it is still running. Returns the key to pass
    /// to [`complete_free`](Self::complete_free) after the grace period,
    /// or `None` if the slot was already freed.
    pub fn free(&mut self, index: SlotIndex) -> Option<SlotKey> {
        let slot = self.slots.get_mut(index.get())?;
        if !slot.mark_freed() {
            trace!(slot = %index, "Slot already freed");
            return None;
        }
        debug!(slot = %index, delay_ms = self.free_delay.as_millis() as u64, "Connection freed");
        Some(slot.key())
    }

    /// Returns a freed slot to the pool.
    ///
    /// Returns a snapshot of the registered listeners, in registration
    /// order, for the caller to notify. Stale or repeated calls return an
    /// empty list.
    pub fn complete_free(&mut self, key: SlotKey) -> Vec<(ListenerId, LaunchId)> {
        let Some(slot) = self.slots.get_mut(key.index.get()) else {
            return Vec::new();
        };
        if slot.key() != key || slot.state() != SlotState::Freed {
            return Vec::new();
        }

        slot.reset();
        trace!(slot = %key.index, listeners = self.listeners.len(), "Connection returned to pool");
        self.listeners.clone()
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Registers a request to be told when a slot frees up.
    pub fn add_listener(&mut self, launch: LaunchId) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, launch));
        id
    }

    /// Deregisters a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener, _)| *listener != id);
        self.listeners.len() != before
    }

    /// Returns `true` if the listener is still registered.
    #[must_use]
    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.listeners.iter().any(|(listener, _)| *listener == id)
    }

    /// Number of registered listeners.
    #[inline]
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns `true` if [`allocate`](Self::allocate) would succeed.
    #[must_use]
    pub fn is_free_connection_available(&self) -> bool {
        self.capacity == Capacity::OnDemand || self.slots.iter().any(is_available)
    }

    /// Returns the sizing policy.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Number of slots currently handed out, freed-but-pending included.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_allocated()).count()
    }

    /// Returns `true` if any slot is handed out.
    #[must_use]
    pub fn any_connection_allocated(&self) -> bool {
        self.slots.iter().any(ConnectionSlot::is_allocated)
    }

    /// Returns the grace period between free and reuse.
    #[inline]
    #[must_use]
    pub fn free_delay(&self) -> Duration {
        self.free_delay
    }

    /// Returns a slot by index.
    #[inline]
    #[must_use]
    pub fn slot(&self, index: SlotIndex) -> Option<&ConnectionSlot> {
        self.slots.get(index.get())
    }

    /// Returns a slot by index, mutably.
    #[inline]
    pub fn slot_mut(&mut self, index: SlotIndex) -> Option<&mut ConnectionSlot> {
        self.slots.get_mut(index.get())
    }

    /// Iterates over all slots.
    pub fn slots(&self) -> impl Iterator<Item = &ConnectionSlot> {
        self.slots.iter()
    }

    /// Takes every slot's transport task handle.
    pub(crate) fn drain_tasks(&mut self) -> Vec<JoinHandle<()>> {
        self.slots
            .iter_mut()
            .filter_map(ConnectionSlot::take_task)
            .collect()
    }
}

fn is_available(slot: &ConnectionSlot) -> bool {
    !slot.is_allocated() && slot.state() == SlotState::Free
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn fixed(n: usize) -> ConnectionAllocator {
        ConnectionAllocator::new(Capacity::Fixed(n), Duration::ZERO)
    }

    #[test]
    fn test_lowest_index_first() {
        let mut allocator = fixed(3);
        assert_eq!(allocator.allocate(None), Some(SlotIndex::new(0)));
        assert_eq!(allocator.allocate(None), Some(SlotIndex::new(1)));

        let key = allocator.free(SlotIndex::new(0)).expect("freed");
        allocator.complete_free(key);

        assert_eq!(allocator.allocate(None), Some(SlotIndex::new(0)));
        assert_eq!(allocator.allocate(None), Some(SlotIndex::new(2)));
        assert_eq!(allocator.allocate(None), None);
    }

    #[test]
    fn test_freed_slot_unavailable_until_complete() {
        let mut allocator = fixed(1);
        let index = allocator.allocate(None).expect("slot");
        let key = allocator.free(index).expect("freed");

        assert!(!allocator.is_free_connection_available());
        assert_eq!(allocator.allocate(None), None);

        allocator.complete_free(key);
        assert!(allocator.is_free_connection_available());
        assert!(!allocator.any_connection_allocated());
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut allocator = fixed(1);
        let launch = LaunchId::next();
        allocator.add_listener(launch);

        let index = allocator.allocate(Some(LaunchId::next())).expect("slot");
        let key = allocator.free(index).expect("freed");
        assert!(allocator.free(index).is_none());

        assert_eq!(allocator.complete_free(key).len(), 1);
        assert!(allocator.complete_free(key).is_empty());
        assert!(allocator.free(index).is_none());
        assert_eq!(allocator.allocated_count(), 0);
    }

    #[test]
    fn test_stale_complete_ignored() {
        let mut allocator = fixed(1);
        let index = allocator.allocate(None).expect("slot");
        let old = allocator.free(index).expect("freed");
        allocator.complete_free(old);

        let index = allocator.allocate(None).expect("slot again");
        allocator.free(index).expect("freed again");
        assert!(allocator.complete_free(old).is_empty());
        assert_eq!(allocator.slot(index).map(ConnectionSlot::state), Some(SlotState::Freed));
    }

    #[test]
    fn test_on_demand_grows() {
        let mut allocator = ConnectionAllocator::new(Capacity::OnDemand, Duration::ZERO);
        assert!(allocator.is_free_connection_available());
        for i in 0..5 {
            assert_eq!(allocator.allocate(None), Some(SlotIndex::new(i)));
        }
        assert_eq!(allocator.allocated_count(), 5);
        assert!(allocator.is_free_connection_available());
    }

    #[test]
    fn test_listeners_in_registration_order() {
        let mut allocator = fixed(1);
        let a = LaunchId::next();
        let b = LaunchId::next();
        let la = allocator.add_listener(a);
        let lb = allocator.add_listener(b);

        let index = allocator.allocate(None).expect("slot");
        let key = allocator.free(index).expect("freed");
        let snapshot = allocator.complete_free(key);
        assert_eq!(snapshot, vec![(la, a), (lb, b)]);

        assert!(allocator.remove_listener(la));
        assert!(!allocator.remove_listener(la));
        assert!(!allocator.has_listener(la));
        assert!(allocator.has_listener(lb));
        assert_eq!(allocator.listener_count(), 1);
    }

    #[test]
    fn test_owner_assignment() {
        let mut allocator = fixed(2);
        let owner = LaunchId::next();
        let index = allocator.allocate(Some(owner)).expect("slot");
        assert_eq!(allocator.slot(index).and_then(ConnectionSlot::owner), Some(owner));

        allocator.free(index);
        assert!(allocator.slot(index).and_then(ConnectionSlot::owner).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Free(usize),
        Complete(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Allocate),
            (0usize..4).prop_map(Op::Free),
            (0usize..4).prop_map(Op::Complete),
        ]
    }

    proptest! {
        #[test]
        fn prop_accounting_holds(ops in proptest::collection::vec(op(), 1..64)) {
            let mut allocator = fixed(3);
            allocator.add_listener(LaunchId::next());
            let mut pending: Vec<Option<SlotKey>> = vec![None; 4];
            let mut notifications = 0usize;
            let mut completions = 0usize;

            for op in ops {
                match op {
                    Op::Allocate => {
                        let available = allocator.is_free_connection_available();
                        prop_assert_eq!(allocator.allocate(None).is_some(), available);
                    }
                    Op::Free(i) => {
                        let was_allocated = allocator
                            .slot(SlotIndex::new(i))
                            .is_some_and(|s| s.is_allocated() && s.state() != SlotState::Freed);
                        let key = allocator.free(SlotIndex::new(i));
                        prop_assert_eq!(key.is_some(), was_allocated);
                        if key.is_some() {
                            pending[i] = key;
                        }
                    }
                    Op::Complete(i) => {
                        if let Some(key) = pending[i].take() {
                            completions += 1;
                            notifications += allocator.complete_free(key).len();
                            prop_assert!(allocator.complete_free(key).is_empty());
                        }
                    }
                }

                prop_assert!(allocator.allocated_count() <= 3);
            }

            // One listener, so exactly one notification per completed free.
            prop_assert_eq!(notifications, completions);
        }
    }
}
