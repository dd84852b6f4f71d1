//! Worker-side connection service.
//!
//! [`WorkerService`] receives the bind and setup steps on the IPC thread
//! and gates a separate main thread on them:
//!
//! ```text
//! IPC thread:   bind ──► setup ──► (ack) ............... shutdown ──► destroy
//!                           │                                           │
//! main thread:  wait ◄──────┘ ──► load_runtime ──► run_main             │
//!                                       └──────── destroy waits ◄───────┘
//! ```
//!
//! The main thread never loads the runtime before setup arrived, and
//! destroy never runs before runtime loading finished.

// ============================================================================
// Imports
// ============================================================================

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{CallerId, Pid};
use crate::protocol::{
    HostMessage, SetupBundle, StartParams, WorkerMessage, decode_line, encode_line,
};

use super::delegate::{HostContext, ReceivedFile, WorkerServiceDelegate};

// ============================================================================
// WorkerExit
// ============================================================================

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `run_main` returned.
    MainReturned,
    /// `load_runtime` returned `false`.
    RuntimeLoadFailed,
    /// The launcher asked for an abnormal exit.
    Crashed,
    /// The launcher asked for a normal exit.
    Shutdown,
    /// The launcher went away.
    HostDisconnected,
    /// The launcher sent something the worker could not accept.
    ProtocolViolation,
}

impl WorkerExit {
    /// Process exit code for this reason.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::MainReturned | Self::Shutdown | Self::HostDisconnected => 0,
            Self::RuntimeLoadFailed => 1,
            Self::ProtocolViolation => 2,
            Self::Crashed => 134,
        }
    }

    /// Returns `true` for exits that run the destroy step.
    #[inline]
    #[must_use]
    pub const fn is_orderly(self) -> bool {
        matches!(self, Self::Shutdown | Self::HostDisconnected)
    }

    /// Terminates the current process accordingly.
    pub fn exit_process(self) -> ! {
        if self == Self::Crashed {
            std::process::abort();
        }
        std::process::exit(self.exit_code())
    }
}

// ============================================================================
// Reply
// ============================================================================

/// What the IPC loop does after handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send a message back to the launcher.
    Send(WorkerMessage),
    /// Nothing to send.
    Nothing,
    /// Stop serving.
    Exit(WorkerExit),
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum RuntimeState {
    #[default]
    Pending,
    Loaded,
    Failed,
}

#[derive(Debug, Default)]
struct ServiceState {
    params: Option<StartParams>,
    bound_caller: Option<CallerId>,
    context: Option<Arc<HostContext>>,
    /// Set while the one accepted setup is being processed.
    setting_up: bool,
    runtime: RuntimeState,
    main_started: bool,
    abandoned: bool,
    destroyed: bool,
}

struct ServiceInner {
    delegate: Arc<dyn WorkerServiceDelegate>,
    reported_pid: Option<Pid>,
    state: Mutex<ServiceState>,
    connection_ready: Condvar,
    runtime_ready: Condvar,
}

// ============================================================================
// WorkerService
// ============================================================================

/// The worker half of the handshake.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkerService")
            .field("bound", &state.params.is_some())
            .field("setup", &state.context.is_some())
            .field("runtime", &state.runtime)
            .finish_non_exhaustive()
    }
}

impl WorkerService {
    /// Creates a service reporting the current process id.
    #[must_use]
    pub fn new(delegate: impl WorkerServiceDelegate) -> Self {
        Self::create(Arc::new(delegate), None)
    }

    /// Creates a service that reports `pid` instead of the current
    /// process id. Used when several workers share one process.
    #[must_use]
    pub fn with_pid(delegate: impl WorkerServiceDelegate, pid: Pid) -> Self {
        Self::create(Arc::new(delegate), Some(pid))
    }

    fn create(delegate: Arc<dyn WorkerServiceDelegate>, reported_pid: Option<Pid>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                delegate,
                reported_pid,
                state: Mutex::new(ServiceState::default()),
                connection_ready: Condvar::new(),
                runtime_ready: Condvar::new(),
            }),
        }
    }

    /// Returns `true` once setup has been accepted.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().context.is_some()
    }

    /// Returns `true` once the runtime loaded successfully.
    #[must_use]
    pub fn is_runtime_loaded(&self) -> bool {
        self.inner.state.lock().runtime == RuntimeState::Loaded
    }
}

// ============================================================================
// WorkerService - Handshake
// ============================================================================

impl WorkerService {
    /// Handles the bind step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyBound`] on a second bind.
    pub fn on_service_bound(&self, params: StartParams) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.params.is_some() {
                return Err(Error::AlreadyBound);
            }
            state.params = Some(params.clone());
        }

        debug!(caller = %params.caller, binding = ?params.binding, "Service bound");
        self.inner.delegate.on_service_bound(&params);
        Ok(())
    }

    /// Restricts setup to `caller`. The first caller wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallerMismatch`] if a different caller is latched.
    pub fn bind_to_caller(&self, caller: CallerId) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.bound_caller {
            Some(expected) if expected != caller => Err(Error::caller_mismatch(expected, caller)),
            Some(_) => Ok(()),
            None => {
                state.bound_caller = Some(caller);
                debug!(caller = %caller, "Latched to caller");
                Ok(())
            }
        }
    }

    /// Handles the setup step and returns the pid to acknowledge with.
    ///
    /// Transferred files are reopened before returning, since the launcher
    /// closes its copies once it sees the acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`Error::CallerMismatch`] if the service is latched to another caller
    /// - [`Error::Protocol`] if setup arrives before bind or twice
    pub fn on_connection_setup(&self, caller: CallerId, bundle: SetupBundle) -> Result<Pid> {
        let pid = self
            .inner
            .reported_pid
            .or_else(Pid::current)
            .ok_or_else(|| Error::protocol("worker pid unavailable"))?;

        // Reserve the setup before leaving the lock; nothing below can fail.
        let params = {
            let mut state = self.inner.state.lock();
            if let Some(expected) = state.bound_caller
                && expected != caller
            {
                return Err(Error::caller_mismatch(expected, caller));
            }
            if state.setting_up || state.context.is_some() {
                return Err(Error::protocol("duplicate setup"));
            }
            let params = state
                .params
                .clone()
                .ok_or_else(|| Error::protocol("setup before bind"))?;
            state.setting_up = true;
            params
        };

        let files = bundle
            .files
            .iter()
            .map(|descriptor| {
                let file = params.host_pid.and_then(|host| {
                    descriptor
                        .open_from(host)
                        .inspect_err(|e| {
                            warn!(file_id = descriptor.id, error = %e, "Could not reopen transferred file");
                        })
                        .ok()
                });
                ReceivedFile {
                    descriptor: *descriptor,
                    file,
                }
            })
            .collect();

        let context = Arc::new(HostContext {
            params,
            command_line: bundle.command_line,
            files,
            extras: bundle.extras,
        });

        self.inner.delegate.on_connection_setup(&context);

        {
            let mut state = self.inner.state.lock();
            state.setting_up = false;
            state.context = Some(context);
            self.inner.connection_ready.notify_all();
        }

        info!(pid = %pid, "Connection set up");
        Ok(pid)
    }

    /// Dispatches one launcher message.
    ///
    /// # Errors
    ///
    /// Returns the handshake error; the IPC loop reports it and exits.
    pub fn handle_message(&self, message: HostMessage) -> Result<Reply> {
        match message {
            HostMessage::Bind { params } => {
                let latch = params.bind_to_caller.then_some(params.caller);
                self.on_service_bound(params)?;
                if let Some(caller) = latch {
                    self.bind_to_caller(caller)?;
                }
                Ok(Reply::Send(WorkerMessage::Bound))
            }

            HostMessage::Setup { caller, bundle } => {
                let pid = self.on_connection_setup(caller, bundle)?;
                Ok(Reply::Send(WorkerMessage::Connected { pid }))
            }

            HostMessage::UpdateBinding { strength } => {
                debug!(binding = ?strength, "Binding strength updated");
                Ok(Reply::Nothing)
            }

            HostMessage::Crash => Ok(Reply::Exit(WorkerExit::Crashed)),
            HostMessage::Shutdown => Ok(Reply::Exit(WorkerExit::Shutdown)),
        }
    }
}

// ============================================================================
// WorkerService - Main Thread & Teardown
// ============================================================================

impl WorkerService {
    /// Starts the main thread. `on_exit` runs on it with the exit reason.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the main thread was already started or the
    ///   service was destroyed
    /// - [`Error::Io`] if the thread cannot be spawned
    pub fn start_main<F>(&self, on_exit: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce(WorkerExit) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(Error::protocol("service already destroyed"));
            }
            if state.main_started {
                return Err(Error::protocol("main thread already started"));
            }
            state.main_started = true;
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("worker-main".into())
            .spawn(move || on_exit(run_main_thread(&inner)))?;
        Ok(handle)
    }

    /// Tears the service down.
    ///
    /// Waits for runtime loading to finish first. Without a setup nothing
    /// was initialized, so the delegate is not called. Later calls are
    /// no-ops.
    pub fn on_destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;

        if state.context.is_none() {
            state.abandoned = true;
            self.inner.connection_ready.notify_all();
            debug!("Destroyed before setup");
            return;
        }

        if state.main_started {
            while state.runtime == RuntimeState::Pending {
                self.inner.runtime_ready.wait(&mut state);
            }
        }
        drop(state);

        self.inner.delegate.on_destroy();
        info!("Service destroyed");
    }
}

fn run_main_thread(inner: &ServiceInner) -> WorkerExit {
    let context = {
        let mut state = inner.state.lock();
        loop {
            if let Some(context) = &state.context {
                break Arc::clone(context);
            }
            if state.abandoned {
                return WorkerExit::Shutdown;
            }
            inner.connection_ready.wait(&mut state);
        }
    };

    let loaded = inner.delegate.load_runtime(&context);
    {
        let mut state = inner.state.lock();
        state.runtime = if loaded {
            RuntimeState::Loaded
        } else {
            RuntimeState::Failed
        };
        inner.runtime_ready.notify_all();
    }

    if !loaded {
        error!("Failed to load worker runtime");
        return WorkerExit::RuntimeLoadFailed;
    }

    inner.delegate.on_before_main();
    inner.delegate.run_main();
    debug!("Worker main returned");
    WorkerExit::MainReturned
}

// ============================================================================
// WorkerService - IPC Loop
// ============================================================================

impl WorkerService {
    /// Runs the blocking IPC loop over a line-framed reader and writer.
    pub fn serve<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> WorkerExit {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Host read failed");
                    return WorkerExit::HostDisconnected;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let message = match decode_line::<HostMessage>(&line) {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Malformed host message");
                    return WorkerExit::ProtocolViolation;
                }
            };

            match self.handle_message(message) {
                Ok(Reply::Send(reply)) => {
                    if let Err(e) = write_line(&mut writer, &reply) {
                        warn!(error = %e, "Host write failed");
                        return WorkerExit::HostDisconnected;
                    }
                }
                Ok(Reply::Nothing) => {}
                Ok(Reply::Exit(exit)) => return exit,
                Err(e) => {
                    error!(error = %e, "Handshake rejected");
                    let _ = write_line(
                        &mut writer,
                        &WorkerMessage::Rejected {
                            reason: e.to_string(),
                        },
                    );
                    return WorkerExit::ProtocolViolation;
                }
            }
        }

        WorkerExit::HostDisconnected
    }

    /// Serves the launcher over stdin/stdout until the first exit reason.
    ///
    /// Starts the main thread, runs the IPC loop on its own thread and
    /// returns whichever finishes first. Orderly exits run the destroy step.
    pub fn serve_stdio(&self) -> WorkerExit {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

        let main_tx = exit_tx.clone();
        if let Err(e) = self.start_main(move |exit| {
            let _ = main_tx.send(exit);
        }) {
            error!(error = %e, "Failed to start main thread");
            return WorkerExit::ProtocolViolation;
        }

        let service = self.clone();
        let ipc = thread::Builder::new().name("worker-ipc".into()).spawn(move || {
            let exit = service.serve(io::stdin().lock(), io::stdout());
            let _ = exit_tx.send(exit);
        });
        if let Err(e) = ipc {
            error!(error = %e, "Failed to start IPC thread");
            return WorkerExit::ProtocolViolation;
        }

        let exit = exit_rx.blocking_recv().unwrap_or(WorkerExit::HostDisconnected);
        info!(exit = ?exit, "Worker exiting");

        if exit.is_orderly() {
            self.on_destroy();
        }
        exit
    }
}

fn write_line<W: Write, T: serde::Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let line = encode_line(message)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
