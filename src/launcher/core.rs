//! Launcher task and its public handles.
//!
//! All allocator, request and registry state lives in one tokio task.
//! [`Launcher`] and [`LaunchHandle`] talk to it over a command channel;
//! slot tasks report transport events over a second channel. Nothing in
//! that state is shared, so none of it is locked.
//!
//! # Event Loop
//!
//! The launcher task selects over:
//!
//! - Commands from handles (launch, setup, stop, warm-up, queries)
//! - Deferred free completions it scheduled for itself
//! - Slot notifications, dropped when their generation is stale

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::allocator::{Capacity, ConnectionAllocator};
use crate::config::{LauncherBuilder, LauncherConfig};
use crate::error::{Error, Result};
use crate::identifiers::{CallerId, LaunchId, Pid, SlotIndex};
use crate::protocol::{BindingStrength, StartParams};
use crate::transport::{
    ChildSpawner, ConnectionSlot, SlotEvent, SlotEventSink, SlotInfo, SlotKey, SlotNotification,
};

use super::registry::ProcessRegistry;
use super::request::{LaunchFailure, LaunchOptions, LaunchRequest, LaunchState};

// ============================================================================
// LauncherCommand
// ============================================================================

type Reply<T> = oneshot::Sender<T>;

/// Messages handled by the launcher task.
enum LauncherCommand {
    Launch {
        options: LaunchOptions,
        reply: Reply<Result<(LaunchId, watch::Receiver<LaunchState>)>>,
    },
    Setup {
        launch: LaunchId,
        reply: Reply<Result<()>>,
    },
    Stop {
        launch: LaunchId,
        reply: Reply<Result<()>>,
    },
    SetBinding {
        launch: LaunchId,
        strength: BindingStrength,
        reply: Reply<Result<()>>,
    },
    WarmUp {
        reply: Reply<Result<SlotIndex>>,
    },
    Crash {
        pid: Pid,
        reply: Reply<bool>,
    },
    Lookup {
        pid: Pid,
        reply: Reply<Option<LaunchId>>,
    },
    Stats {
        reply: Reply<LauncherStats>,
    },
    CompleteFree(SlotKey),
    Shutdown {
        reply: Reply<Vec<JoinHandle<()>>>,
    },
}

// ============================================================================
// LauncherStats
// ============================================================================

/// Snapshot of launcher occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LauncherStats {
    /// Pool sizing policy.
    pub capacity: Capacity,
    /// Connections handed out, pending frees included.
    pub allocated: usize,
    /// Workers in the ready state.
    pub ready: usize,
    /// Requests waiting for a freed connection.
    pub queued: usize,
    /// Idle warmed-up connections.
    pub spares: usize,
    /// Requests not yet finished.
    pub requests: usize,
}

// ============================================================================
// LaunchContext
// ============================================================================

/// Launcher state shared by every request.
pub(crate) struct LaunchContext {
    pub(crate) allocator: ConnectionAllocator,
    pub(crate) registry: ProcessRegistry,
    pub(crate) spares: VecDeque<SlotIndex>,
    pub(crate) caller: CallerId,
    pub(crate) config: LauncherConfig,
    spawner: Arc<dyn ChildSpawner>,
    slot_sink: SlotEventSink,
    commands: mpsc::WeakUnboundedSender<LauncherCommand>,
}

impl LaunchContext {
    /// Bind parameters for a new connection.
    pub(crate) fn start_params(&self, binding: BindingStrength) -> StartParams {
        let mut params = StartParams::new(self.caller);
        params.bind_to_caller = self.config.bind_to_caller;
        params.binding = binding;
        params
    }

    /// Starts binding a freshly allocated slot.
    pub(crate) fn start_slot(&mut self, index: SlotIndex, params: StartParams) -> Result<()> {
        let spawner = Arc::clone(&self.spawner);
        let sink = self.slot_sink.clone();
        let timeouts = self.config.timeouts();

        let slot = self
            .allocator
            .slot_mut(index)
            .ok_or_else(|| Error::invalid_argument(format!("{index} does not exist")))?;
        slot.start(spawner, params, sink, timeouts)
    }

    /// Frees a slot and schedules its return to the pool.
    pub(crate) fn free_slot(&mut self, index: SlotIndex) {
        let Some(key) = self.allocator.free(index) else {
            return;
        };
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        let delay = self.allocator.free_delay();
        if delay.is_zero() {
            let _ = commands.send(LauncherCommand::CompleteFree(key));
        } else {
            tokio::spawn(async move {
                sleep(delay).await;
                let _ = commands.send(LauncherCommand::CompleteFree(key));
            });
        }
    }

    pub(crate) fn slot_info(&self, index: SlotIndex) -> Option<SlotInfo> {
        self.allocator.slot(index).map(ConnectionSlot::info)
    }

    pub(crate) fn capacity_limit(&self) -> usize {
        self.allocator.capacity().limit().unwrap_or(usize::MAX)
    }
}

// ============================================================================
// LauncherCore
// ============================================================================

struct LauncherCore {
    requests: FxHashMap<LaunchId, LaunchRequest>,
    cx: LaunchContext,
}

impl LauncherCore {
    fn handle_command(&mut self, command: LauncherCommand) {
        match command {
            LauncherCommand::Launch { options, reply } => {
                let _ = reply.send(self.launch(options));
            }
            LauncherCommand::Setup { launch, reply } => {
                let result = self.with_request(launch, |request, cx| request.setup_connection(cx));
                let _ = reply.send(result.and_then(|r| r));
            }
            LauncherCommand::Stop { launch, reply } => {
                let _ = reply.send(self.with_request(launch, |request, cx| request.stop(cx)));
            }
            LauncherCommand::SetBinding {
                launch,
                strength,
                reply,
            } => {
                let result =
                    self.with_request(launch, |request, cx| request.set_binding(strength, cx));
                let _ = reply.send(result);
            }
            LauncherCommand::WarmUp { reply } => {
                let _ = reply.send(self.warm_up());
            }
            LauncherCommand::Crash { pid, reply } => {
                let _ = reply.send(self.crash_process(pid));
            }
            LauncherCommand::Lookup { pid, reply } => {
                let _ = reply.send(self.cx.registry.get(pid));
            }
            LauncherCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            LauncherCommand::CompleteFree(key) => self.complete_free(key),
            LauncherCommand::Shutdown { reply } => {
                let _ = reply.send(self.shutdown());
            }
        }
    }

    fn launch(&mut self, options: LaunchOptions) -> Result<(LaunchId, watch::Receiver<LaunchState>)> {
        let (mut request, state_rx) = LaunchRequest::new(options, self.cx.config.default_binding);
        let id = request.id();

        request.start(&mut self.cx)?;
        debug!(launch = %id, state = ?request.state(), "Launch started");

        if !request.is_terminal() {
            self.requests.insert(id, request);
        }
        Ok((id, state_rx))
    }

    /// Runs `f` on a live request and drops it once it is finished.
    fn with_request<R>(
        &mut self,
        id: LaunchId,
        f: impl FnOnce(&mut LaunchRequest, &mut LaunchContext) -> R,
    ) -> Result<R> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| Error::launch_not_found(id))?;
        let result = f(request, &mut self.cx);
        if request.is_terminal() {
            self.requests.remove(&id);
        }
        Ok(result)
    }

    fn handle_slot_event(&mut self, notification: SlotNotification) {
        let SlotNotification { key, event } = notification;

        let Some(slot) = self.cx.allocator.slot(key.index) else {
            return;
        };
        if slot.key() != key {
            trace!(slot = %key.index, generation = key.generation, "Dropping stale slot event");
            return;
        }

        match slot.owner() {
            Some(owner) => {
                if self
                    .with_request(owner, |request, cx| request.on_slot_event(event, cx))
                    .is_err()
                {
                    trace!(slot = %key.index, launch = %owner, "Slot event for finished launch");
                }
            }
            None => self.handle_spare_event(key.index, event),
        }
    }

    fn handle_spare_event(&mut self, index: SlotIndex, event: SlotEvent) {
        if !self.cx.spares.contains(&index) {
            trace!(slot = %index, event = ?event, "Dropping event for released slot");
            return;
        }

        match event {
            SlotEvent::Started => {
                let started = self
                    .cx
                    .allocator
                    .slot_mut(index)
                    .map(ConnectionSlot::on_started);
                match started {
                    Some(Err(e)) => warn!(slot = %index, error = %e, "Spare bind out of order"),
                    _ => debug!(slot = %index, "Spare connection bound"),
                }
            }
            SlotEvent::StartFailed { reason } => {
                warn!(slot = %index, reason = %reason, "Spare connection failed to bind");
                self.cx.spares.retain(|spare| *spare != index);
                self.cx.free_slot(index);
            }
            SlotEvent::Died => {
                info!(slot = %index, "Spare connection died");
                self.cx.spares.retain(|spare| *spare != index);
                self.cx.free_slot(index);
            }
            other => trace!(slot = %index, event = ?other, "Ignoring spare event"),
        }
    }

    /// Returns a freed slot to the pool and retries queued launches.
    ///
    /// Listeners are visited in registration order. Each one that finds a
    /// free connection is removed and retried; once none is left the rest
    /// stay registered.
    fn complete_free(&mut self, key: SlotKey) {
        let listeners = self.cx.allocator.complete_free(key);

        for (listener, launch) in listeners {
            if !self.cx.allocator.has_listener(listener) {
                continue;
            }
            if !self.cx.allocator.is_free_connection_available() {
                break;
            }
            self.cx.allocator.remove_listener(listener);
            debug!(launch = %launch, listener = %listener, "Retrying queued launch");

            if self
                .with_request(launch, |request, cx| request.retry_after_free(cx))
                .is_err()
            {
                trace!(launch = %launch, "Queued launch already gone");
            }
        }
    }

    fn warm_up(&mut self) -> Result<SlotIndex> {
        let index = self
            .cx
            .allocator
            .allocate(None)
            .ok_or_else(|| Error::no_capacity(self.cx.capacity_limit()))?;

        let params = self.cx.start_params(self.cx.config.default_binding);
        if let Err(e) = self.cx.start_slot(index, params) {
            self.cx.free_slot(index);
            return Err(e);
        }

        self.cx.spares.push_back(index);
        info!(slot = %index, "Warming up spare connection");
        Ok(index)
    }

    fn crash_process(&mut self, pid: Pid) -> bool {
        let Some(launch) = self.cx.registry.get(pid) else {
            debug!(pid = %pid, "Crash requested for unknown pid");
            return false;
        };
        let Some(index) = self.requests.get(&launch).and_then(LaunchRequest::slot) else {
            return false;
        };
        self.cx
            .allocator
            .slot_mut(index)
            .is_some_and(ConnectionSlot::crash_for_testing)
    }

    fn stats(&self) -> LauncherStats {
        LauncherStats {
            capacity: self.cx.allocator.capacity(),
            allocated: self.cx.allocator.allocated_count(),
            ready: self.cx.registry.len(),
            queued: self.cx.allocator.listener_count(),
            spares: self.cx.spares.len(),
            requests: self.requests.len(),
        }
    }

    /// Ends every launch and hands back the slot tasks to join.
    fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        let count = self.requests.len();
        for (_, mut request) in self.requests.drain() {
            request.shutdown(&mut self.cx);
        }
        for index in std::mem::take(&mut self.cx.spares) {
            self.cx.allocator.free(index);
        }

        info!(requests = count, "Launcher shutting down");
        self.cx.allocator.drain_tasks()
    }
}

async fn run_launcher(
    mut core: LauncherCore,
    mut commands: mpsc::UnboundedReceiver<LauncherCommand>,
    mut slot_events: mpsc::UnboundedReceiver<SlotNotification>,
) {
    debug!(caller = %core.cx.caller, "Launcher task started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(LauncherCommand::Shutdown { reply }) => {
                        let _ = reply.send(core.shutdown());
                        break;
                    }
                    Some(command) => core.handle_command(command),
                    None => {
                        debug!("All launcher handles dropped");
                        core.shutdown();
                        break;
                    }
                }
            }

            Some(notification) = slot_events.recv() => {
                core.handle_slot_event(notification);
            }
        }
    }

    debug!("Launcher task terminated");
}

// ============================================================================
// Launcher
// ============================================================================

/// Handle to a launcher task.
///
/// Cheap to clone. The task stops when [`shutdown`](Self::shutdown) is
/// called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct Launcher {
    commands: mpsc::UnboundedSender<LauncherCommand>,
    caller: CallerId,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Launcher {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> LauncherBuilder {
        LauncherBuilder::new()
    }

    /// Spawns the launcher task. Must run inside a tokio runtime.
    pub(crate) fn start(
        config: LauncherConfig,
        spawner: Arc<dyn ChildSpawner>,
        caller: CallerId,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (slot_sink, slot_rx) = mpsc::unbounded_channel();

        info!(
            capacity = ?config.capacity,
            free_delay_ms = config.free_delay.as_millis() as u64,
            bind_retry_limit = config.bind_retry_limit,
            "Starting launcher"
        );

        let core = LauncherCore {
            requests: FxHashMap::default(),
            cx: LaunchContext {
                allocator: ConnectionAllocator::new(config.capacity, config.free_delay),
                registry: ProcessRegistry::new(),
                spares: VecDeque::new(),
                caller,
                config,
                spawner,
                slot_sink,
                commands: commands.downgrade(),
            },
        };

        let task = tokio::spawn(run_launcher(core, command_rx, slot_rx));

        Self {
            commands,
            caller,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Identity this launcher presents to workers.
    #[inline]
    #[must_use]
    pub fn caller_id(&self) -> CallerId {
        self.caller
    }

    /// Starts a launch.
    ///
    /// Returns once a connection was allocated or the request was queued;
    /// use [`LaunchHandle::wait_ready`] to wait for the worker.
    ///
    /// # Errors
    ///
    /// - [`Error::NoCapacity`] if the pool is full and queueing was not requested
    /// - [`Error::LauncherClosed`] if the launcher has shut down
    pub async fn launch(&self, options: LaunchOptions) -> Result<LaunchHandle> {
        let (id, state) = call(&self.commands, |reply| LauncherCommand::Launch { options, reply })
            .await??;
        Ok(LaunchHandle {
            id,
            state,
            commands: self.commands.clone(),
        })
    }

    /// Binds an idle spare connection that later launches can reuse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCapacity`] if the pool is full.
    pub async fn warm_up(&self) -> Result<SlotIndex> {
        call(&self.commands, |reply| LauncherCommand::WarmUp { reply }).await?
    }

    /// Crashes the worker with `pid`.
    ///
    /// Returns `false`, without side effects, if `pid` is not a ready
    /// worker of this launcher.
    pub async fn crash_process_for_testing(&self, pid: Pid) -> bool {
        call(&self.commands, |reply| LauncherCommand::Crash { pid, reply })
            .await
            .unwrap_or(false)
    }

    /// Returns the launch owning a ready worker.
    pub async fn lookup(&self, pid: Pid) -> Option<LaunchId> {
        call(&self.commands, |reply| LauncherCommand::Lookup { pid, reply })
            .await
            .ok()
            .flatten()
    }

    /// Returns an occupancy snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LauncherClosed`] if the launcher has shut down.
    pub async fn stats(&self) -> Result<LauncherStats> {
        call(&self.commands, |reply| LauncherCommand::Stats { reply }).await
    }

    /// Stops every launch, waits for the transports to close and ends
    /// the launcher task. Later calls return immediately.
    ///
    /// # Errors
    ///
    /// Currently infallible; reserved for transport teardown errors.
    pub async fn shutdown(&self) -> Result<()> {
        if let Ok(tasks) = call(&self.commands, |reply| LauncherCommand::Shutdown { reply }).await
        {
            let count = tasks.len();
            for result in join_all(tasks).await {
                if let Err(e) = result {
                    debug!(error = %e, "Slot task ended abnormally");
                }
            }
            debug!(count, "Slot tasks joined");
        }

        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Launcher task ended abnormally");
        }
        Ok(())
    }
}

/// Sends a command and waits for its reply.
async fn call<T>(
    commands: &mpsc::UnboundedSender<LauncherCommand>,
    make: impl FnOnce(Reply<T>) -> LauncherCommand,
) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(make(reply))
        .map_err(|_| Error::LauncherClosed)?;
    rx.await.map_err(|_| Error::LauncherClosed)
}

// ============================================================================
// LaunchHandle
// ============================================================================

/// Caller's view of one launch.
#[derive(Debug, Clone)]
pub struct LaunchHandle {
    id: LaunchId,
    state: watch::Receiver<LaunchState>,
    commands: mpsc::UnboundedSender<LauncherCommand>,
}

impl LaunchHandle {
    /// Returns the launch id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> LaunchId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LaunchState {
        self.state.borrow().clone()
    }

    /// Returns the worker pid once ready.
    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.state.borrow().pid()
    }

    /// Waits until the worker is ready or the launch ends.
    ///
    /// # Errors
    ///
    /// - [`Error::LaunchFailed`] if the launch failed or was stopped
    /// - [`Error::LauncherClosed`] if the launcher went away first
    pub async fn wait_ready(&self) -> Result<Pid> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(LaunchState::is_settled)
            .await
            .map_err(|_| Error::LauncherClosed)?
            .clone();

        match settled {
            LaunchState::Ready(pid) => Ok(pid),
            LaunchState::Failed(failure) => Err(Error::launch_failed(self.id, failure)),
            _ => Err(Error::launch_failed(self.id, LaunchFailure::Stopped)),
        }
    }

    /// Sends setup for a launch started with
    /// [`LaunchOptions::without_setup`]. Idempotent.
    ///
    /// # Errors
    ///
    /// - [`Error::LaunchNotFound`] if the launch already ended
    /// - [`Error::InvalidArgument`] if the launch cannot be set up in its state
    pub async fn setup_connection(&self) -> Result<()> {
        let launch = self.id;
        call(&self.commands, |reply| LauncherCommand::Setup { launch, reply }).await?
    }

    /// Stops the launch and releases its connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LaunchNotFound`] if the launch already ended.
    pub async fn stop(&self) -> Result<()> {
        let launch = self.id;
        call(&self.commands, |reply| LauncherCommand::Stop { launch, reply }).await?
    }

    /// Changes the binding strength of the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LaunchNotFound`] if the launch already ended.
    pub async fn set_binding(&self, strength: BindingStrength) -> Result<()> {
        let launch = self.id;
        call(&self.commands, |reply| LauncherCommand::SetBinding {
            launch,
            strength,
            reply,
        })
        .await?
    }
}
