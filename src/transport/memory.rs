//! In-process transport for tests.
//!
//! [`MemorySpawner`] runs each worker as a tokio task connected through
//! unbounded channels. Workers follow a script of [`FakeWorker`]
//! behaviours, one entry per spawn, so tests can inject bind failures,
//! silent workers and deaths at any handshake step.
//!
//! # Example
//!
//! ```ignore
//! let spawner = MemorySpawner::new().with_script([FakeWorker::FailSpawn]);
//! let launcher = Launcher::builder().spawner(spawner.clone()).build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{Pid, SlotIndex};
use crate::protocol::{HostMessage, WorkerMessage};
use crate::worker::{Reply, WorkerExit, WorkerService};

use super::spawner::{ChildChannel, ChildSpawner, SpawnRequest};

// ============================================================================
// Constants
// ============================================================================

/// First pid handed to a fake worker.
const FIRST_FAKE_PID: u32 = 10_000;

// ============================================================================
// FakeWorker
// ============================================================================

/// Builds a [`WorkerService`] for a fake worker with the given pid.
pub type ServiceFactory = Arc<dyn Fn(Pid) -> WorkerService + Send + Sync>;

/// Scripted behaviour of one fake worker.
#[derive(Clone, Default)]
pub enum FakeWorker {
    /// Completes every step.
    #[default]
    Healthy,
    /// The spawn itself fails.
    FailSpawn,
    /// Refuses the bind and exits.
    RejectBind,
    /// Never answers anything.
    Unresponsive,
    /// Acknowledges bind, then exits.
    DieAfterBind,
    /// Refuses the setup bundle.
    RejectSetup,
    /// Never acknowledges setup.
    SilentSetup,
    /// Runs a real [`WorkerService`].
    Service(ServiceFactory),
}

impl FakeWorker {
    /// Wraps a service factory.
    #[must_use]
    pub fn service(factory: impl Fn(Pid) -> WorkerService + Send + Sync + 'static) -> Self {
        Self::Service(Arc::new(factory))
    }
}

impl fmt::Debug for FakeWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Healthy => "Healthy",
            Self::FailSpawn => "FailSpawn",
            Self::RejectBind => "RejectBind",
            Self::Unresponsive => "Unresponsive",
            Self::DieAfterBind => "DieAfterBind",
            Self::RejectSetup => "RejectSetup",
            Self::SilentSetup => "SilentSetup",
            Self::Service(_) => "Service",
        };
        f.write_str(name)
    }
}

// ============================================================================
// MemorySpawner
// ============================================================================

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<FakeWorker>>,
    fallback: Mutex<FakeWorker>,
    next_pid: AtomicU32,
    spawned: AtomicUsize,
    kill_switches: Mutex<FxHashMap<SlotIndex, Arc<Notify>>>,
    received: Mutex<Vec<(SlotIndex, HostMessage)>>,
}

/// Spawner whose workers live in the current runtime.
///
/// Clones share the script and the observed traffic.
#[derive(Clone)]
pub struct MemorySpawner {
    shared: Arc<Shared>,
}

impl Default for MemorySpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemorySpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySpawner")
            .field("spawned", &self.spawn_count())
            .field("live", &self.live_workers())
            .finish_non_exhaustive()
    }
}

impl MemorySpawner {
    /// Creates a spawner whose workers are all healthy.
    #[must_use]
    pub fn new() -> Self {
        let shared = Shared {
            next_pid: AtomicU32::new(FIRST_FAKE_PID),
            ..Shared::default()
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Queues behaviours for the next spawns, in order.
    #[must_use]
    pub fn with_script(self, script: impl IntoIterator<Item = FakeWorker>) -> Self {
        self.shared.script.lock().extend(script);
        self
    }

    /// Sets the behaviour used once the script is exhausted.
    #[must_use]
    pub fn with_fallback(self, behaviour: FakeWorker) -> Self {
        *self.shared.fallback.lock() = behaviour;
        self
    }

    /// Appends behaviours to the script.
    pub fn push_script(&self, script: impl IntoIterator<Item = FakeWorker>) {
        self.shared.script.lock().extend(script);
    }

    /// Number of spawn attempts so far, failed ones included.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.shared.spawned.load(Ordering::SeqCst)
    }

    /// Number of worker tasks still running.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.kill_switches.lock().len()
    }

    /// Every message workers received, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<(SlotIndex, HostMessage)> {
        self.shared.received.lock().clone()
    }

    /// Kills the worker bound to `slot` as if it crashed on its own.
    ///
    /// Returns `false` if no worker is running for that slot.
    pub fn kill_slot(&self, slot: SlotIndex) -> bool {
        match self.shared.kill_switches.lock().get(&slot) {
            Some(switch) => {
                switch.notify_one();
                true
            }
            None => false,
        }
    }

    fn next_behaviour(&self) -> FakeWorker {
        self.shared
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.shared.fallback.lock().clone())
    }
}

#[async_trait]
impl ChildSpawner for MemorySpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn ChildChannel>> {
        self.shared.spawned.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.next_behaviour();

        if matches!(behaviour, FakeWorker::FailSpawn) {
            return Err(Error::spawn_failed(io::Error::new(
                io::ErrorKind::NotFound,
                "scripted spawn failure",
            )));
        }

        let pid = Pid::new(self.shared.next_pid.fetch_add(1, Ordering::SeqCst))
            .ok_or_else(|| Error::protocol("fake pid space exhausted"))?;

        let (to_worker, inbox) = mpsc::unbounded_channel();
        let (outbox, from_worker) = mpsc::unbounded_channel();
        let kill = Arc::new(Notify::new());

        self.shared
            .kill_switches
            .lock()
            .insert(request.slot, Arc::clone(&kill));

        debug!(slot = %request.slot, pid = %pid, behaviour = ?behaviour, "Fake worker spawned");

        tokio::spawn(run_fake_worker(FakeWorkerTask {
            behaviour,
            pid,
            slot: request.slot,
            inbox,
            outbox,
            kill: Arc::clone(&kill),
            shared: Arc::clone(&self.shared),
        }));

        Ok(Box::new(MemoryChannel {
            to_worker,
            from_worker,
            kill,
        }))
    }
}

// ============================================================================
// MemoryChannel
// ============================================================================

struct MemoryChannel {
    to_worker: mpsc::UnboundedSender<HostMessage>,
    from_worker: mpsc::UnboundedReceiver<WorkerMessage>,
    kill: Arc<Notify>,
}

#[async_trait]
impl ChildChannel for MemoryChannel {
    async fn send(&mut self, message: &HostMessage) -> Result<()> {
        self.to_worker
            .send(message.clone())
            .map_err(|_| Error::protocol("fake worker is gone"))
    }

    async fn recv(&mut self) -> Option<Result<WorkerMessage>> {
        self.from_worker.recv().await.map(Ok)
    }

    async fn kill(&mut self) {
        self.kill.notify_one();
    }
}

// ============================================================================
// Fake Worker Task
// ============================================================================

struct FakeWorkerTask {
    behaviour: FakeWorker,
    pid: Pid,
    slot: SlotIndex,
    inbox: mpsc::UnboundedReceiver<HostMessage>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    kill: Arc<Notify>,
    shared: Arc<Shared>,
}

/// What a fake worker does with one message.
enum Step {
    Reply(WorkerMessage),
    Ignore,
    ReplyAndExit(WorkerMessage, WorkerExit),
    Exit(WorkerExit),
}

async fn run_fake_worker(task: FakeWorkerTask) {
    let FakeWorkerTask {
        behaviour,
        pid,
        slot,
        mut inbox,
        outbox,
        kill,
        shared,
    } = task;

    let service = match &behaviour {
        FakeWorker::Service(factory) => Some(factory(pid)),
        _ => None,
    };

    let (main_tx, mut main_rx) = mpsc::unbounded_channel();
    if let Some(service) = &service
        && let Err(e) = service.start_main(move |exit| {
            let _ = main_tx.send(exit);
        })
    {
        warn!(slot = %slot, error = %e, "Fake worker main thread failed to start");
        return;
    }

    let exit = loop {
        tokio::select! {
            () = kill.notified() => break WorkerExit::Crashed,

            exit = main_rx.recv(), if service.is_some() => {
                break exit.unwrap_or(WorkerExit::MainReturned);
            }

            message = inbox.recv() => {
                let Some(message) = message else {
                    break WorkerExit::HostDisconnected;
                };
                shared.received.lock().push((slot, message.clone()));

                let step = match &service {
                    Some(service) => service_step(service, message),
                    None => scripted_step(&behaviour, pid, message),
                };

                match step {
                    Step::Reply(reply) => {
                        let _ = outbox.send(reply);
                    }
                    Step::Ignore => {}
                    Step::ReplyAndExit(reply, exit) => {
                        let _ = outbox.send(reply);
                        break exit;
                    }
                    Step::Exit(exit) => break exit,
                }
            }
        }
    };

    {
        let mut switches = shared.kill_switches.lock();
        if switches.get(&slot).is_some_and(|s| Arc::ptr_eq(s, &kill)) {
            switches.remove(&slot);
        }
    }
    drop(outbox);

    trace!(slot = %slot, pid = %pid, exit = ?exit, "Fake worker exited");

    if let Some(service) = service
        && exit.is_orderly()
    {
        let _ = tokio::task::spawn_blocking(move || service.on_destroy()).await;
    }
}

fn scripted_step(behaviour: &FakeWorker, pid: Pid, message: HostMessage) -> Step {
    match (message, behaviour) {
        (_, FakeWorker::Unresponsive) => Step::Ignore,

        (HostMessage::Bind { .. }, FakeWorker::RejectBind) => Step::ReplyAndExit(
            WorkerMessage::Rejected {
                reason: "scripted bind rejection".into(),
            },
            WorkerExit::ProtocolViolation,
        ),
        (HostMessage::Bind { .. }, FakeWorker::DieAfterBind) => {
            Step::ReplyAndExit(WorkerMessage::Bound, WorkerExit::Crashed)
        }
        (HostMessage::Bind { .. }, _) => Step::Reply(WorkerMessage::Bound),

        (HostMessage::Setup { .. }, FakeWorker::RejectSetup) => {
            Step::Reply(WorkerMessage::Rejected {
                reason: "scripted setup rejection".into(),
            })
        }
        (HostMessage::Setup { .. }, FakeWorker::SilentSetup) => Step::Ignore,
        (HostMessage::Setup { .. }, _) => Step::Reply(WorkerMessage::Connected { pid }),

        (HostMessage::UpdateBinding { .. }, _) => Step::Ignore,
        (HostMessage::Crash, _) => Step::Exit(WorkerExit::Crashed),
        (HostMessage::Shutdown, _) => Step::Exit(WorkerExit::Shutdown),
    }
}

fn service_step(service: &WorkerService, message: HostMessage) -> Step {
    match service.handle_message(message) {
        Ok(Reply::Send(reply)) => Step::Reply(reply),
        Ok(Reply::Nothing) => Step::Ignore,
        Ok(Reply::Exit(exit)) => Step::Exit(exit),
        Err(e) => Step::ReplyAndExit(
            WorkerMessage::Rejected {
                reason: e.to_string(),
            },
            WorkerExit::ProtocolViolation,
        ),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    use crate::identifiers::CallerId;
    use crate::protocol::{BindingStrength, SetupBundle, StartParams};

    fn request(slot: usize) -> SpawnRequest {
        SpawnRequest {
            slot: SlotIndex::new(slot),
            binding: BindingStrength::Moderate,
        }
    }

    async fn recv(channel: &mut Box<dyn ChildChannel>) -> Option<WorkerMessage> {
        timeout(Duration::from_secs(5), channel.recv())
            .await
            .expect("reply in time")
            .map(|m| m.expect("decoded"))
    }

    fn bind() -> HostMessage {
        HostMessage::Bind {
            params: StartParams::new(CallerId::generate()),
        }
    }

    #[tokio::test]
    async fn test_healthy_worker() {
        let spawner = MemorySpawner::new();
        let mut channel = spawner.spawn(request(0)).await.expect("spawn");

        channel.send(&bind()).await.expect("send");
        assert_eq!(recv(&mut channel).await, Some(WorkerMessage::Bound));

        channel
            .send(&HostMessage::Setup {
                caller: CallerId::generate(),
                bundle: SetupBundle::default(),
            })
            .await
            .expect("send");
        let Some(WorkerMessage::Connected { pid }) = recv(&mut channel).await else {
            panic!("expected connected");
        };
        assert_eq!(pid.as_u32(), FIRST_FAKE_PID);

        channel.send(&HostMessage::Shutdown).await.expect("send");
        assert_eq!(recv(&mut channel).await, None);
        assert_eq!(spawner.received().len(), 3);
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let spawner = MemorySpawner::new().with_script([FakeWorker::FailSpawn]);
        assert!(spawner.spawn(request(0)).await.is_err());
        assert!(spawner.spawn(request(0)).await.is_ok());
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_die_after_bind() {
        let spawner = MemorySpawner::new().with_script([FakeWorker::DieAfterBind]);
        let mut channel = spawner.spawn(request(0)).await.expect("spawn");

        channel.send(&bind()).await.expect("send");
        assert_eq!(recv(&mut channel).await, Some(WorkerMessage::Bound));
        assert_eq!(recv(&mut channel).await, None);
    }

    #[tokio::test]
    async fn test_kill_slot() {
        let spawner = MemorySpawner::new();
        let mut channel = spawner.spawn(request(2)).await.expect("spawn");
        assert_eq!(spawner.live_workers(), 1);

        assert!(spawner.kill_slot(SlotIndex::new(2)));
        assert!(!spawner.kill_slot(SlotIndex::new(3)));
        assert_eq!(recv(&mut channel).await, None);
        assert_eq!(spawner.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_dropping_host_ends_worker() {
        let spawner = MemorySpawner::new();
        let channel = spawner.spawn(request(0)).await.expect("spawn");
        drop(channel);

        timeout(Duration::from_secs(5), async {
            while spawner.live_workers() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker exits");
    }
}
