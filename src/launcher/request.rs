//! Launch request state machine.
//!
//! A [`LaunchRequest`] drives one launch from allocation to a ready
//! worker:
//!
//! ```text
//! Idle ─start─► Allocating ─started─► Bound ─setup─► SettingUp ─connected─► Ready
//!   │  │            │                   │                │                    │
//!   │  └─► Queued ──┘ (slot freed)      └──── died ──────┴─► Failed        stop/died
//!   │                                                                       │
//!   └─► Failed (no capacity / bind retries exhausted)        Idle ◄─ Dying ◄┘
//! ```
//!
//! Requests live on the launcher task and are only touched through a
//! [`LaunchContext`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{LaunchId, ListenerId, Pid, SlotIndex};
use crate::protocol::{BindingStrength, FileHandleSet, SetupBundle};
use crate::transport::{ConnectionSlot, SlotEvent, SlotInfo, SlotState};

use super::core::LaunchContext;
use super::delegate::{LaunchDelegate, NoopDelegate};

// ============================================================================
// LaunchState
// ============================================================================

/// Observable state of a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchState {
    /// Not started, or stopped.
    Idle,
    /// Waiting for a connection to be freed.
    Queued,
    /// Connection allocated, bind in progress.
    Allocating,
    /// Worker bound, setup not sent.
    Bound,
    /// Setup sent, waiting for acknowledgement.
    SettingUp,
    /// Worker ready.
    Ready(Pid),
    /// Being torn down.
    Dying,
    /// Ended without a ready worker.
    Failed(LaunchFailure),
}

impl LaunchState {
    /// Returns the worker pid once ready.
    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Option<Pid> {
        match self {
            Self::Ready(pid) => Some(*pid),
            _ => None,
        }
    }

    /// Returns `true` once the request is finished for good.
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed(_))
    }

    /// Returns `true` for states a waiter can stop waiting on.
    #[inline]
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Idle | Self::Failed(_))
    }
}

// ============================================================================
// LaunchFailure
// ============================================================================

/// Why a launch ended without a ready worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchFailure {
    /// No connection could be allocated.
    NoCapacity,
    /// Every bind attempt failed.
    BindFailed {
        /// Attempts made.
        attempts: u32,
    },
    /// The worker refused setup.
    SetupFailed {
        /// Reported reason.
        reason: String,
    },
    /// The worker did not acknowledge setup before the deadline.
    SetupTimedOut {
        /// Deadline that expired.
        after_ms: u64,
    },
    /// The worker died between bind and setup acknowledgement.
    DiedBeforeReady,
    /// The request was stopped before it became ready.
    Stopped,
    /// The launcher shut down.
    Shutdown,
}

impl fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCapacity => f.write_str("no free connection"),
            Self::BindFailed { attempts } => write!(f, "bind failed after {attempts} attempts"),
            Self::SetupFailed { reason } => write!(f, "setup failed: {reason}"),
            Self::SetupTimedOut { after_ms } => {
                write!(f, "setup not acknowledged within {after_ms}ms")
            }
            Self::DiedBeforeReady => f.write_str("worker died before it was ready"),
            Self::Stopped => f.write_str("stopped"),
            Self::Shutdown => f.write_str("launcher shut down"),
        }
    }
}

// ============================================================================
// LaunchOptions
// ============================================================================

/// Parameters of one launch.
///
/// # Example
///
/// ```ignore
/// let options = LaunchOptions::new(["--type=renderer"])
///     .with_files(files)
///     .queue_if_no_free_connection()
///     .delegate(MyDelegate::default());
/// ```
pub struct LaunchOptions {
    pub(crate) command_line: Vec<String>,
    pub(crate) files: FileHandleSet,
    pub(crate) delegate: Box<dyn LaunchDelegate>,
    pub(crate) setup_connection: bool,
    pub(crate) queue_if_no_free: bool,
    pub(crate) binding: Option<BindingStrength>,
}

impl fmt::Debug for LaunchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchOptions")
            .field("command_line", &self.command_line)
            .field("files", &self.files.len())
            .field("setup_connection", &self.setup_connection)
            .field("queue_if_no_free", &self.queue_if_no_free)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl LaunchOptions {
    /// Creates options for the given worker command line.
    #[must_use]
    pub fn new(command_line: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command_line: command_line.into_iter().map(Into::into).collect(),
            files: FileHandleSet::empty(),
            delegate: Box::new(NoopDelegate),
            setup_connection: true,
            queue_if_no_free: false,
            binding: None,
        }
    }

    /// Appends a command-line argument.
    #[inline]
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.command_line.push(arg.into());
        self
    }

    /// Sets the files transferred at setup.
    #[inline]
    #[must_use]
    pub fn with_files(mut self, files: FileHandleSet) -> Self {
        self.files = files;
        self
    }

    /// Waits for a freed connection instead of failing when none is free.
    #[inline]
    #[must_use]
    pub fn queue_if_no_free_connection(mut self) -> Self {
        self.queue_if_no_free = true;
        self
    }

    /// Stops after bind. Setup is sent by
    /// [`LaunchHandle::setup_connection`](super::LaunchHandle::setup_connection).
    #[inline]
    #[must_use]
    pub fn without_setup(mut self) -> Self {
        self.setup_connection = false;
        self
    }

    /// Binds the worker with strong binding.
    #[inline]
    #[must_use]
    pub fn strong_binding(mut self) -> Self {
        self.binding = Some(BindingStrength::Strong);
        self
    }

    /// Sets the delegate.
    #[inline]
    #[must_use]
    pub fn delegate(mut self, delegate: impl LaunchDelegate) -> Self {
        self.delegate = Box::new(delegate);
        self
    }
}

// ============================================================================
// LaunchRequest
// ============================================================================

/// Launcher-side record of one launch.
pub(crate) struct LaunchRequest {
    id: LaunchId,
    command_line: Vec<String>,
    files: FileHandleSet,
    delegate: Box<dyn LaunchDelegate>,
    setup_connection: bool,
    queue_if_no_free: bool,
    binding: BindingStrength,
    slot: Option<SlotIndex>,
    listener: Option<ListenerId>,
    bind_attempts: u32,
    connected: bool,
    state_tx: watch::Sender<LaunchState>,
}

impl LaunchRequest {
    /// Creates an idle request and the receiver its handle watches.
    pub(crate) fn new(
        options: LaunchOptions,
        default_binding: BindingStrength,
    ) -> (Self, watch::Receiver<LaunchState>) {
        let (state_tx, state_rx) = watch::channel(LaunchState::Idle);
        let request = Self {
            id: LaunchId::next(),
            command_line: options.command_line,
            files: options.files,
            delegate: options.delegate,
            setup_connection: options.setup_connection,
            queue_if_no_free: options.queue_if_no_free,
            binding: options.binding.unwrap_or(default_binding),
            slot: None,
            listener: None,
            bind_attempts: 0,
            connected: false,
            state_tx,
        };
        (request, state_rx)
    }

    #[inline]
    pub(crate) fn id(&self) -> LaunchId {
        self.id
    }

    #[inline]
    pub(crate) fn slot(&self) -> Option<SlotIndex> {
        self.slot
    }

    pub(crate) fn state(&self) -> LaunchState {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state_tx.borrow().is_terminal()
    }

    fn set_state(&self, state: LaunchState) {
        trace!(launch = %self.id, state = ?state, "Launch state");
        self.state_tx.send_replace(state);
    }

    fn slot_info(&self, cx: &LaunchContext) -> Option<SlotInfo> {
        self.slot.and_then(|index| cx.slot_info(index))
    }
}

// ============================================================================
// LaunchRequest - Start
// ============================================================================

impl LaunchRequest {
    /// Obtains a connection and begins binding it.
    ///
    /// Prefers a warmed-up spare, then allocates. With no free
    /// connection the request queues or fails, as configured.
    pub(crate) fn start(&mut self, cx: &mut LaunchContext) -> Result<()> {
        self.try_start(self.queue_if_no_free, cx)
    }

    fn try_start(&mut self, queue: bool, cx: &mut LaunchContext) -> Result<()> {
        if self.take_spare(cx) {
            return Ok(());
        }

        let Some(index) = cx.allocator.allocate(Some(self.id)) else {
            if queue {
                let listener = cx.allocator.add_listener(self.id);
                self.listener = Some(listener);
                self.set_state(LaunchState::Queued);
                debug!(launch = %self.id, listener = %listener, "Waiting for a free connection");
                return Ok(());
            }
            return Err(Error::no_capacity(cx.capacity_limit()));
        };

        self.slot = Some(index);
        self.set_state(LaunchState::Allocating);

        let mut params = cx.start_params(self.binding);
        self.delegate.on_before_connection_allocated(&mut params);

        if let Err(e) = cx.start_slot(index, params) {
            self.slot = None;
            cx.free_slot(index);
            return Err(e);
        }
        debug!(launch = %self.id, slot = %index, attempt = self.bind_attempts + 1, "Binding connection");
        Ok(())
    }

    /// Retries after a freed-listener fired.
    pub(crate) fn retry_after_free(&mut self, cx: &mut LaunchContext) {
        self.listener = None;
        if let Err(e) = self.try_start(true, cx) {
            debug!(launch = %self.id, error = %e, "Retry after free found no connection");
            self.fail(LaunchFailure::NoCapacity, cx);
        }
    }

    fn take_spare(&mut self, cx: &mut LaunchContext) -> bool {
        if cx.spares.is_empty() {
            return false;
        }

        let spares: Vec<SlotInfo> = cx
            .spares
            .iter()
            .filter_map(|index| cx.slot_info(*index))
            .collect();
        let Some(index) = self.delegate.get_existing_connection(&spares) else {
            return false;
        };
        let Some(position) = cx.spares.iter().position(|spare| *spare == index) else {
            warn!(launch = %self.id, slot = %index, "Delegate picked a connection that is not a spare");
            return false;
        };
        cx.spares.remove(position);

        let Some(slot) = cx.allocator.slot_mut(index) else {
            return false;
        };
        slot.set_owner(Some(self.id));
        slot.set_binding_strength(self.binding);
        let bound = slot.state() == SlotState::Bound;

        self.slot = Some(index);
        self.set_state(LaunchState::Allocating);
        debug!(launch = %self.id, slot = %index, bound, "Reusing warmed-up connection");

        if bound {
            self.on_child_started(cx);
        }
        true
    }
}

// ============================================================================
// LaunchRequest - Transport Events
// ============================================================================

impl LaunchRequest {
    /// Applies a transport event from this request's slot.
    pub(crate) fn on_slot_event(&mut self, event: SlotEvent, cx: &mut LaunchContext) {
        let state = self.state();
        match event {
            SlotEvent::Started if state == LaunchState::Allocating => {
                let started = self
                    .slot
                    .and_then(|index| cx.allocator.slot_mut(index))
                    .map(ConnectionSlot::on_started);
                if let Some(Err(e)) = started {
                    warn!(launch = %self.id, error = %e, "Ignoring bind completion");
                    return;
                }
                self.on_child_started(cx);
            }

            SlotEvent::StartFailed { reason } if state == LaunchState::Allocating => {
                self.on_child_start_failed(&reason, cx);
            }

            SlotEvent::Connected { pid } if state == LaunchState::SettingUp => {
                self.on_connected(pid, cx);
            }

            SlotEvent::SetupFailed { reason } if state == LaunchState::SettingUp => {
                warn!(launch = %self.id, reason = %reason, "Connection setup failed");
                self.abort(LaunchFailure::SetupFailed { reason }, cx);
            }

            SlotEvent::SetupTimedOut { after_ms } if state == LaunchState::SettingUp => {
                warn!(launch = %self.id, after_ms, "Connection setup timed out");
                self.abort(LaunchFailure::SetupTimedOut { after_ms }, cx);
            }

            SlotEvent::Died => self.on_died(&state, cx),

            other => {
                trace!(launch = %self.id, state = ?state, event = ?other, "Ignoring slot event");
            }
        }
    }

    fn on_child_started(&mut self, cx: &mut LaunchContext) {
        self.set_state(LaunchState::Bound);
        if let Some(info) = self.slot_info(cx) {
            self.delegate.on_connection_bound(&info);
        }

        if self.setup_connection
            && let Err(e) = self.send_setup(cx)
        {
            warn!(launch = %self.id, error = %e, "Could not send setup");
            self.abort(
                LaunchFailure::SetupFailed {
                    reason: e.to_string(),
                },
                cx,
            );
        }
    }

    fn on_child_start_failed(&mut self, reason: &str, cx: &mut LaunchContext) {
        self.bind_attempts += 1;
        if let Some(index) = self.slot.take() {
            cx.free_slot(index);
        }
        warn!(launch = %self.id, attempts = self.bind_attempts, reason = %reason, "Bind failed");

        if self.bind_attempts > cx.config.bind_retry_limit {
            self.fail(
                LaunchFailure::BindFailed {
                    attempts: self.bind_attempts,
                },
                cx,
            );
            return;
        }

        // The failed slot is still in its grace period, so the retry may
        // have to wait for it.
        if let Err(e) = self.try_start(true, cx) {
            debug!(launch = %self.id, error = %e, "Bind retry found no connection");
            self.fail(LaunchFailure::NoCapacity, cx);
        }
    }

    fn on_connected(&mut self, pid: Pid, cx: &mut LaunchContext) {
        if self.connected {
            warn!(launch = %self.id, pid = %pid, "Duplicate connection acknowledgement");
            return;
        }
        let Some(slot) = self.slot.and_then(|index| cx.allocator.slot_mut(index)) else {
            return;
        };
        if let Err(e) = slot.on_connected(pid) {
            warn!(launch = %self.id, error = %e, "Ignoring connection acknowledgement");
            return;
        }

        self.connected = true;
        cx.registry.insert(pid, self.id);
        if let Some(info) = self.slot_info(cx) {
            self.delegate.on_connection_established(&info);
        }

        let closed = self.files.close_all();
        info!(launch = %self.id, pid = %pid, files_closed = closed, "Worker ready");
        self.set_state(LaunchState::Ready(pid));
    }

    fn on_died(&mut self, state: &LaunchState, cx: &mut LaunchContext) {
        match state {
            LaunchState::Ready(pid) => {
                info!(launch = %self.id, pid = %pid, "Worker died");
                self.stop(cx);
            }
            LaunchState::Allocating => self.on_child_start_failed("worker died during bind", cx),
            LaunchState::Bound | LaunchState::SettingUp => {
                warn!(launch = %self.id, "Worker died before it was ready");
                self.abort(LaunchFailure::DiedBeforeReady, cx);
            }
            _ => trace!(launch = %self.id, state = ?state, "Ignoring death"),
        }
    }
}

// ============================================================================
// LaunchRequest - Caller Operations
// ============================================================================

impl LaunchRequest {
    /// Sends setup now, or as soon as the connection is bound.
    pub(crate) fn setup_connection(&mut self, cx: &mut LaunchContext) -> Result<()> {
        match self.state() {
            LaunchState::Queued | LaunchState::Allocating => {
                self.setup_connection = true;
                Ok(())
            }
            LaunchState::Bound => {
                self.setup_connection = true;
                self.send_setup(cx)
            }
            LaunchState::SettingUp | LaunchState::Ready(_) => Ok(()),
            state => Err(Error::invalid_argument(format!(
                "{} cannot set up a connection in state {state:?}",
                self.id
            ))),
        }
    }

    fn send_setup(&mut self, cx: &mut LaunchContext) -> Result<()> {
        let index = self
            .slot
            .ok_or_else(|| Error::invalid_argument(format!("{} has no connection", self.id)))?;

        let mut bundle = SetupBundle::new(self.command_line.clone(), self.files.descriptors());
        if let Some(info) = cx.slot_info(index) {
            self.delegate.on_before_connection_setup(&info, &mut bundle);
        }

        let caller = cx.caller;
        let slot = cx
            .allocator
            .slot_mut(index)
            .ok_or_else(|| Error::invalid_argument(format!("{index} does not exist")))?;
        slot.setup(caller, bundle)?;

        self.set_state(LaunchState::SettingUp);
        Ok(())
    }

    /// Tears the launch down. Safe to call in any state.
    pub(crate) fn stop(&mut self, cx: &mut LaunchContext) {
        if self.is_terminal() {
            return;
        }

        if let Some(index) = self.slot.take() {
            if let Some(info) = cx.slot_info(index) {
                self.delegate.on_connection_lost(&info);
            }
            if let Some(pid) = self.state().pid() {
                cx.registry.remove(pid);
            }
            self.set_state(LaunchState::Dying);
            cx.free_slot(index);
        }

        if let Some(listener) = self.listener.take() {
            cx.allocator.remove_listener(listener);
        }
        self.files.close_all();

        debug!(launch = %self.id, "Launch stopped");
        self.set_state(LaunchState::Idle);
    }

    /// Changes the binding strength of the connection.
    pub(crate) fn set_binding(&mut self, strength: BindingStrength, cx: &mut LaunchContext) {
        self.binding = strength;
        if let Some(slot) = self.slot.and_then(|index| cx.allocator.slot_mut(index)) {
            slot.set_binding_strength(strength);
        }
    }

    /// Ends the launch because the launcher is going away.
    pub(crate) fn shutdown(&mut self, cx: &mut LaunchContext) {
        match self.state() {
            LaunchState::Ready(_) => self.stop(cx),
            state if state.is_terminal() => {}
            _ => self.abort(LaunchFailure::Shutdown, cx),
        }
    }

    /// Frees the connection without telling the delegate it was lost, then fails.
    fn abort(&mut self, failure: LaunchFailure, cx: &mut LaunchContext) {
        if let Some(index) = self.slot.take() {
            cx.free_slot(index);
        }
        self.fail(failure, cx);
    }

    fn fail(&mut self, failure: LaunchFailure, cx: &mut LaunchContext) {
        if let Some(listener) = self.listener.take() {
            cx.allocator.remove_listener(listener);
        }
        self.files.close_all();

        warn!(launch = %self.id, failure = %failure, "Launch failed");
        self.delegate.on_launch_failed(&failure);
        self.set_state(LaunchState::Failed(failure));
    }
}

impl fmt::Debug for LaunchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchRequest")
            .field("id", &self.id)
            .field("state", &*self.state_tx.borrow())
            .field("slot", &self.slot)
            .field("bind_attempts", &self.bind_attempts)
            .finish_non_exhaustive()
    }
}
