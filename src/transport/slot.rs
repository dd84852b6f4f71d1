//! Connection slots and their event loop.
//!
//! A [`ConnectionSlot`] is the launcher-side record of one worker
//! connection. Starting it spawns a tokio task that owns the
//! [`ChildChannel`], runs the handshake and reports [`SlotEvent`]s back to
//! the launcher task.
//!
//! # State Machine
//!
//! ```text
//! Free ─start─► Binding ─started─► Bound ─setup─► SettingUp ─connected─► Ready
//!   ▲             │                  │                │                   │
//!   │             └──────────────────┴───── Dying ◄───┴───────────────────┘
//!   │                                         │
//!   └──────────── reset ◄──── Freed ◄─────────┘
//! ```
//!
//! Each reuse bumps the slot's generation. Events carry the generation
//! they were produced under, so the launcher drops anything a previous
//! occupant reports late.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{CallerId, LaunchId, Pid, SlotIndex};
use crate::protocol::{BindingStrength, HostMessage, SetupBundle, StartParams, WorkerMessage};

use super::spawner::{ChildChannel, ChildSpawner, SpawnRequest};

// ============================================================================
// SlotState
// ============================================================================

/// Lifecycle state of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Not started.
    Free,
    /// Waiting for the platform to bind the worker.
    Binding,
    /// Worker bound, setup not sent yet.
    Bound,
    /// Setup sent, waiting for acknowledgement.
    SettingUp,
    /// Handshake complete, pid known.
    Ready,
    /// Stopped or died, not yet released.
    Dying,
    /// Release scheduled; returns to `Free` when the grace period ends.
    Freed,
}

impl SlotState {
    /// Returns `true` if moving from `self` to `next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Free, Self::Binding)
                | (Self::Binding, Self::Bound)
                | (Self::Bound, Self::SettingUp)
                | (Self::SettingUp, Self::Ready)
                | (
                    Self::Free | Self::Binding | Self::Bound | Self::SettingUp | Self::Ready,
                    Self::Dying
                )
                | (Self::Dying, Self::Freed)
                | (Self::Freed, Self::Free)
        )
    }

    /// Returns `true` while a worker may be attached.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            Self::Binding | Self::Bound | Self::SettingUp | Self::Ready
        )
    }
}

// ============================================================================
// Events
// ============================================================================

/// Identifies one occupancy of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    /// Slot index.
    pub index: SlotIndex,
    /// Occupancy counter.
    pub generation: u64,
}

/// Transport event reported to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    /// Bind completed.
    Started,
    /// Bind failed; terminal for this occupancy.
    StartFailed {
        /// Description of the failure.
        reason: String,
    },
    /// Setup acknowledged.
    Connected {
        /// Worker process id.
        pid: Pid,
    },
    /// Setup refused.
    SetupFailed {
        /// Description of the failure.
        reason: String,
    },
    /// Setup not acknowledged before the deadline.
    SetupTimedOut {
        /// Deadline that passed, in milliseconds.
        after_ms: u64,
    },
    /// Worker went away after binding.
    Died,
}

/// A [`SlotEvent`] tagged with the occupancy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotNotification {
    /// Producing occupancy.
    pub key: SlotKey,
    /// The event.
    pub event: SlotEvent,
}

/// Where slot tasks deliver their notifications.
pub type SlotEventSink = mpsc::UnboundedSender<SlotNotification>;

/// Handshake and teardown deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTimeouts {
    /// Maximum time from spawn to the worker's `bound` reply.
    pub bind: Duration,
    /// Maximum time from sending setup to the worker's `connected` reply.
    pub setup: Duration,
    /// Time a worker gets to exit after `shutdown` before it is killed.
    pub shutdown_grace: Duration,
}

/// Commands from the launcher to a slot task.
#[derive(Debug)]
enum SlotCommand {
    Setup {
        caller: CallerId,
        bundle: SetupBundle,
    },
    UpdateBinding(BindingStrength),
    Crash,
    Stop,
}

// ============================================================================
// SlotInfo
// ============================================================================

/// Read-only snapshot of a slot handed to delegates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Slot index.
    pub index: SlotIndex,
    /// Current state.
    pub state: SlotState,
    /// Worker pid, once the handshake completed.
    pub pid: Option<Pid>,
    /// Current binding strength.
    pub binding: BindingStrength,
    /// Launch request the slot is assigned to.
    pub owner: Option<LaunchId>,
}

// ============================================================================
// ConnectionSlot
// ============================================================================

/// One bindable worker connection.
///
/// Owned by the allocator and only touched from the launcher task.
#[derive(Debug)]
pub struct ConnectionSlot {
    index: SlotIndex,
    generation: u64,
    state: SlotState,
    pid: Option<Pid>,
    binding: BindingStrength,
    allocated: bool,
    owner: Option<LaunchId>,
    killed_by_us: bool,
    command_tx: Option<mpsc::UnboundedSender<SlotCommand>>,
    task: Option<JoinHandle<()>>,
}

// ============================================================================
// ConnectionSlot - Constructor & Accessors
// ============================================================================

impl ConnectionSlot {
    /// Creates an unallocated slot.
    pub(crate) fn new(index: SlotIndex) -> Self {
        Self {
            index,
            generation: 0,
            state: SlotState::Free,
            pid: None,
            binding: BindingStrength::default(),
            allocated: false,
            owner: None,
            killed_by_us: false,
            command_tx: None,
            task: None,
        }
    }

    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Returns the key of the current occupancy.
    #[inline]
    #[must_use]
    pub fn key(&self) -> SlotKey {
        SlotKey {
            index: self.index,
            generation: self.generation,
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Returns the worker pid. Only set once the slot reached `Ready`.
    #[inline]
    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Returns the current binding strength.
    #[inline]
    #[must_use]
    pub fn binding_strength(&self) -> BindingStrength {
        self.binding
    }

    /// Returns `true` if the allocator has handed this slot out.
    #[inline]
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Returns the launch request this slot is assigned to.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> Option<LaunchId> {
        self.owner
    }

    /// Returns `true` if the launcher stopped this worker itself.
    #[inline]
    #[must_use]
    pub fn is_killed_by_us(&self) -> bool {
        self.killed_by_us
    }

    /// Returns a snapshot for delegates.
    #[must_use]
    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            index: self.index,
            state: self.state,
            pid: self.pid,
            binding: self.binding,
            owner: self.owner,
        }
    }
}

// ============================================================================
// ConnectionSlot - Lifecycle
// ============================================================================

impl ConnectionSlot {
    /// Asks the platform to bind a worker for this slot.
    ///
    /// The outcome arrives on `sink` as [`SlotEvent::Started`] or
    /// [`SlotEvent::StartFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the slot is `Free`.
    pub fn start(
        &mut self,
        spawner: Arc<dyn ChildSpawner>,
        params: StartParams,
        sink: SlotEventSink,
        timeouts: SlotTimeouts,
    ) -> Result<()> {
        self.transition(SlotState::Binding, "start")?;
        self.binding = params.binding;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let request = SpawnRequest {
            slot: self.index,
            binding: self.binding,
        };
        let key = self.key();

        debug!(slot = %self.index, generation = self.generation, binding = ?self.binding, "Binding slot");

        self.task = Some(tokio::spawn(run_slot(
            key, spawner, request, params, command_rx, sink, timeouts,
        )));
        self.command_tx = Some(command_tx);
        Ok(())
    }

    /// Records a completed bind.
    pub(crate) fn on_started(&mut self) -> Result<()> {
        self.transition(SlotState::Bound, "on_started")
    }

    /// Sends the setup bundle to the worker.
    ///
    /// The acknowledgement arrives as [`SlotEvent::Connected`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the slot is `Bound`
    /// - [`Error::SetupFailed`] if the slot task is gone
    pub fn setup(&mut self, caller: CallerId, bundle: SetupBundle) -> Result<()> {
        self.transition(SlotState::SettingUp, "setup")?;

        let sent = self
            .command_tx
            .as_ref()
            .is_some_and(|tx| tx.send(SlotCommand::Setup { caller, bundle }).is_ok());

        if !sent {
            return Err(Error::setup_failed(self.index, "slot transport is gone"));
        }
        trace!(slot = %self.index, "Setup sent");
        Ok(())
    }

    /// Records the setup acknowledgement.
    pub(crate) fn on_connected(&mut self, pid: Pid) -> Result<()> {
        self.transition(SlotState::Ready, "on_connected")?;
        self.pid = Some(pid);
        info!(slot = %self.index, pid = %pid, "Slot ready");
        Ok(())
    }

    /// Stops the worker. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(tx) = self.command_tx.take()
            && tx.send(SlotCommand::Stop).is_ok()
        {
            self.killed_by_us = true;
            debug!(slot = %self.index, pid = ?self.pid, "Slot stopped");
        }
        self.mark_dying();
    }

    /// Forces the worker to terminate abnormally.
    ///
    /// Returns `true` if the crash request was handed to a ready worker.
    pub fn crash_for_testing(&mut self) -> bool {
        if self.state != SlotState::Ready {
            return false;
        }
        self.command_tx
            .as_ref()
            .is_some_and(|tx| tx.send(SlotCommand::Crash).is_ok())
    }

    /// Changes the binding strength of a live worker.
    pub fn set_binding_strength(&mut self, strength: BindingStrength) {
        if self.binding == strength {
            return;
        }
        self.binding = strength;
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(SlotCommand::UpdateBinding(strength));
        }
    }
}

// ============================================================================
// ConnectionSlot - Allocator Hooks
// ============================================================================

impl ConnectionSlot {
    /// Marks the slot as handed out.
    pub(crate) fn assign(&mut self, owner: Option<LaunchId>) {
        self.allocated = true;
        self.owner = owner;
    }

    /// Reassigns the slot to another request.
    pub(crate) fn set_owner(&mut self, owner: Option<LaunchId>) {
        self.owner = owner;
    }

    /// Moves any live state to `Dying`.
    pub(crate) fn mark_dying(&mut self) {
        if self.state != SlotState::Dying && self.state.can_transition_to(SlotState::Dying) {
            self.state = SlotState::Dying;
        }
    }

    /// Moves the slot to `Freed`, passing through `Dying` if needed.
    ///
    /// Returns `false` if the slot was already freed.
    pub(crate) fn mark_freed(&mut self) -> bool {
        if matches!(self.state, SlotState::Freed) || !self.allocated {
            return false;
        }
        self.stop();
        self.owner = None;
        self.state = SlotState::Freed;
        true
    }

    /// Returns the slot to `Free` and starts a new occupancy.
    pub(crate) fn reset(&mut self) {
        debug_assert_eq!(self.state, SlotState::Freed);
        self.generation += 1;
        self.state = SlotState::Free;
        self.pid = None;
        self.binding = BindingStrength::default();
        self.allocated = false;
        self.owner = None;
        self.killed_by_us = false;
        self.command_tx = None;
        self.task = None;
    }

    /// Takes the transport task handle, for joining at shutdown.
    pub(crate) fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }

    fn transition(&mut self, next: SlotState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_state(self.index, self.state, operation));
        }
        trace!(slot = %self.index, from = ?self.state, to = ?next, "Slot transition");
        self.state = next;
        Ok(())
    }
}

// ============================================================================
// Slot Event Loop
// ============================================================================

/// Outcome of the bind phase.
enum BindOutcome {
    Bound(Box<dyn ChildChannel>),
    Failed(String),
    Stopped,
}

/// Transport task for one slot occupancy.
async fn run_slot(
    key: SlotKey,
    spawner: Arc<dyn ChildSpawner>,
    request: SpawnRequest,
    params: StartParams,
    mut command_rx: mpsc::UnboundedReceiver<SlotCommand>,
    sink: SlotEventSink,
    timeouts: SlotTimeouts,
) {
    let notify = |event: SlotEvent| {
        let _ = sink.send(SlotNotification { key, event });
    };

    let mut channel = match bind(&*spawner, request, params, &mut command_rx, timeouts.bind).await
    {
        BindOutcome::Bound(channel) => {
            notify(SlotEvent::Started);
            channel
        }
        BindOutcome::Failed(reason) => {
            warn!(slot = %key.index, reason = %reason, "Slot bind failed");
            notify(SlotEvent::StartFailed { reason });
            return;
        }
        BindOutcome::Stopped => {
            debug!(slot = %key.index, "Slot stopped while binding");
            return;
        }
    };

    let mut setup_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            // Messages from the worker
            message = channel.recv() => {
                match message {
                    Some(Ok(WorkerMessage::Connected { pid })) if setup_deadline.is_some() => {
                        setup_deadline = None;
                        notify(SlotEvent::Connected { pid });
                    }

                    Some(Ok(WorkerMessage::Rejected { reason })) if setup_deadline.is_some() => {
                        setup_deadline = None;
                        notify(SlotEvent::SetupFailed { reason });
                    }

                    Some(Ok(other)) => {
                        warn!(slot = %key.index, message = ?other, "Unexpected worker message");
                    }

                    Some(Err(e)) => {
                        warn!(slot = %key.index, error = %e, "Worker channel error");
                        notify(SlotEvent::Died);
                        break;
                    }

                    None => {
                        debug!(slot = %key.index, "Worker disconnected");
                        notify(SlotEvent::Died);
                        break;
                    }
                }
            }

            // Commands from the launcher
            command = command_rx.recv() => {
                match command {
                    Some(SlotCommand::Setup { caller, bundle }) => {
                        match channel.send(&HostMessage::Setup { caller, bundle }).await {
                            Ok(()) => setup_deadline = Some(Instant::now() + timeouts.setup),
                            Err(e) => notify(SlotEvent::SetupFailed { reason: e.to_string() }),
                        }
                    }

                    Some(SlotCommand::UpdateBinding(strength)) => {
                        if let Err(e) = channel.send(&HostMessage::UpdateBinding { strength }).await {
                            debug!(slot = %key.index, error = %e, "Failed to forward binding update");
                        }
                    }

                    Some(SlotCommand::Crash) => {
                        if let Err(e) = channel.send(&HostMessage::Crash).await {
                            warn!(slot = %key.index, error = %e, "Failed to deliver crash request");
                        }
                    }

                    Some(SlotCommand::Stop) | None => {
                        shutdown_gracefully(&mut *channel, key, timeouts.shutdown_grace).await;
                        break;
                    }
                }
            }

            // Setup acknowledgement deadline
            () = sleep_until(setup_deadline.unwrap_or_else(Instant::now)), if setup_deadline.is_some() => {
                setup_deadline = None;
                notify(SlotEvent::SetupTimedOut {
                    after_ms: millis(timeouts.setup),
                });
            }
        }
    }

    channel.kill().await;
    trace!(slot = %key.index, generation = key.generation, "Slot task terminated");
}

/// Asks the worker to exit and waits for it to close its end.
///
/// The caller kills the worker afterwards, so a worker that outlives the
/// grace period is terminated.
async fn shutdown_gracefully(channel: &mut dyn ChildChannel, key: SlotKey, grace: Duration) {
    if let Err(e) = channel.send(&HostMessage::Shutdown).await {
        debug!(slot = %key.index, error = %e, "Worker gone before shutdown");
        return;
    }
    if grace.is_zero() {
        return;
    }

    let drained = timeout(grace, async {
        while let Some(message) = channel.recv().await {
            trace!(slot = %key.index, message = ?message, "Discarding message during shutdown");
        }
    })
    .await;

    match drained {
        Ok(()) => debug!(slot = %key.index, "Worker exited after shutdown"),
        Err(_) => warn!(
            slot = %key.index,
            grace_ms = millis(grace),
            "Worker ignored shutdown, killing"
        ),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Spawns the worker and waits for its `bound` reply.
async fn bind(
    spawner: &dyn ChildSpawner,
    request: SpawnRequest,
    params: StartParams,
    command_rx: &mut mpsc::UnboundedReceiver<SlotCommand>,
    bind_timeout: Duration,
) -> BindOutcome {
    let handshake = timeout(bind_timeout, bind_handshake(spawner, request, params));
    tokio::pin!(handshake);

    loop {
        tokio::select! {
            result = &mut handshake => {
                return match result {
                    Ok(Ok(channel)) => BindOutcome::Bound(channel),
                    Ok(Err(e)) => BindOutcome::Failed(e.to_string()),
                    Err(_) => BindOutcome::Failed(format!(
                        "bind not acknowledged within {}ms",
                        millis(bind_timeout)
                    )),
                };
            }

            command = command_rx.recv() => {
                match command {
                    Some(SlotCommand::Stop) | None => return BindOutcome::Stopped,
                    Some(other) => {
                        debug!(slot = %request.slot, command = ?other, "Ignoring command while binding");
                    }
                }
            }
        }
    }
}

async fn bind_handshake(
    spawner: &dyn ChildSpawner,
    request: SpawnRequest,
    params: StartParams,
) -> Result<Box<dyn ChildChannel>> {
    let mut channel = spawner.spawn(request).await?;
    channel.send(&HostMessage::Bind { params }).await?;

    let failure = match channel.recv().await {
        Some(Ok(WorkerMessage::Bound)) => return Ok(channel),
        Some(Ok(WorkerMessage::Rejected { reason })) => Error::bind_failed(request.slot, reason),
        Some(Ok(other)) => Error::protocol(format!("expected bound, got {other:?}")),
        Some(Err(e)) => e,
        None => Error::bind_failed(request.slot, "worker exited during bind"),
    };

    channel.kill().await;
    Err(failure)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::memory::{FakeWorker, MemorySpawner};

    const TIMEOUTS: SlotTimeouts = SlotTimeouts {
        bind: Duration::from_secs(5),
        setup: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(1),
    };

    fn params() -> StartParams {
        StartParams::new(CallerId::generate())
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SlotNotification>) -> SlotEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("sink open")
            .event
    }

    #[test]
    fn test_transition_table() {
        use SlotState::*;

        assert!(Free.can_transition_to(Binding));
        assert!(Binding.can_transition_to(Bound));
        assert!(Bound.can_transition_to(SettingUp));
        assert!(SettingUp.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Dying));
        assert!(Binding.can_transition_to(Dying));
        assert!(Dying.can_transition_to(Freed));
        assert!(Freed.can_transition_to(Free));

        assert!(!Free.can_transition_to(Ready));
        assert!(!Binding.can_transition_to(SettingUp));
        assert!(!Ready.can_transition_to(Bound));
        assert!(!Freed.can_transition_to(Dying));
    }

    #[test]
    fn test_setup_requires_bound() {
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        let result = slot.setup(CallerId::generate(), SetupBundle::default());
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        assert_eq!(slot.state(), SlotState::Free);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        slot.assign(None);
        slot.stop();
        slot.stop();
        assert_eq!(slot.state(), SlotState::Dying);
        assert!(!slot.is_killed_by_us());
    }

    #[test]
    fn test_crash_requires_ready() {
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        assert!(!slot.crash_for_testing());
    }

    #[test]
    fn test_reset_bumps_generation() {
        let mut slot = ConnectionSlot::new(SlotIndex::new(1));
        slot.assign(Some(LaunchId::next()));
        assert!(slot.mark_freed());
        assert!(!slot.mark_freed());
        slot.reset();

        assert_eq!(slot.state(), SlotState::Free);
        assert_eq!(slot.key().generation, 1);
        assert!(slot.owner().is_none());
        assert!(!slot.is_allocated());
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let spawner = Arc::new(MemorySpawner::new());
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        slot.assign(None);

        slot.start(spawner, params(), sink, TIMEOUTS).expect("start");
        assert_eq!(slot.state(), SlotState::Binding);

        assert_eq!(next_event(&mut rx).await, SlotEvent::Started);
        slot.on_started().expect("bound");

        slot.setup(CallerId::generate(), SetupBundle::new(vec!["--x".into()], Vec::new()))
            .expect("setup");
        let pid = match next_event(&mut rx).await {
            SlotEvent::Connected { pid } => pid,
            other => panic!("unexpected event: {other:?}"),
        };
        slot.on_connected(pid).expect("ready");

        assert_eq!(slot.state(), SlotState::Ready);
        assert_eq!(slot.pid(), Some(pid));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_start_failed() {
        let spawner = Arc::new(MemorySpawner::new().with_script([FakeWorker::FailSpawn]));
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        slot.assign(None);

        slot.start(spawner, params(), sink, TIMEOUTS).expect("start");
        assert!(matches!(next_event(&mut rx).await, SlotEvent::StartFailed { .. }));
    }

    #[tokio::test]
    async fn test_bind_timeout() {
        let spawner = Arc::new(MemorySpawner::new().with_script([FakeWorker::Unresponsive]));
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        slot.assign(None);

        let timeouts = SlotTimeouts {
            bind: Duration::from_millis(20),
            ..TIMEOUTS
        };
        slot.start(spawner, params(), sink, timeouts).expect("start");

        match next_event(&mut rx).await {
            SlotEvent::StartFailed { reason } => assert!(reason.contains("bind")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_setup() {
        let spawner = Arc::new(MemorySpawner::new().with_script([FakeWorker::RejectSetup]));
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        slot.assign(None);

        slot.start(spawner, params(), sink, TIMEOUTS).expect("start");
        assert_eq!(next_event(&mut rx).await, SlotEvent::Started);
        slot.on_started().expect("bound");
        slot.setup(CallerId::generate(), SetupBundle::default()).expect("setup");

        assert!(matches!(next_event(&mut rx).await, SlotEvent::SetupFailed { .. }));
    }

    #[tokio::test]
    async fn test_setup_deadline_reports_timeout() {
        let spawner = Arc::new(MemorySpawner::new().with_script([FakeWorker::SilentSetup]));
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        slot.assign(None);

        let timeouts = SlotTimeouts {
            setup: Duration::from_millis(20),
            ..TIMEOUTS
        };
        slot.start(spawner, params(), sink, timeouts).expect("start");
        assert_eq!(next_event(&mut rx).await, SlotEvent::Started);
        slot.on_started().expect("bound");
        slot.setup(CallerId::generate(), SetupBundle::default()).expect("setup");

        assert_eq!(
            next_event(&mut rx).await,
            SlotEvent::SetupTimedOut { after_ms: 20 }
        );
    }

    #[tokio::test]
    async fn test_stop_waits_for_orderly_exit() {
        let spawner = Arc::new(MemorySpawner::new());
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        slot.assign(None);

        slot.start(spawner.clone(), params(), sink, TIMEOUTS).expect("start");
        assert_eq!(next_event(&mut rx).await, SlotEvent::Started);
        slot.on_started().expect("bound");

        slot.stop();
        let task = slot.take_task().expect("task running");
        timeout(Duration::from_secs(5), task)
            .await
            .expect("task ends in time")
            .expect("task joined");

        assert_eq!(spawner.live_workers(), 0);
        assert!(
            spawner
                .received()
                .iter()
                .any(|(_, message)| *message == HostMessage::Shutdown)
        );
    }

    #[tokio::test]
    async fn test_crash_reports_death() {
        let spawner = Arc::new(MemorySpawner::new());
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut slot = ConnectionSlot::new(SlotIndex::new(0));
        slot.assign(None);

        slot.start(spawner, params(), sink, TIMEOUTS).expect("start");
        assert_eq!(next_event(&mut rx).await, SlotEvent::Started);
        slot.on_started().expect("bound");
        slot.setup(CallerId::generate(), SetupBundle::default()).expect("setup");
        let SlotEvent::Connected { pid } = next_event(&mut rx).await else {
            panic!("expected connected");
        };
        slot.on_connected(pid).expect("ready");

        assert!(slot.crash_for_testing());
        assert_eq!(next_event(&mut rx).await, SlotEvent::Died);
    }
}
