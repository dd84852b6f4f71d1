//! OS process transport.
//!
//! Each bind spawns the worker executable with piped stdin/stdout and
//! runs the handshake as JSON lines over those pipes. Worker exit shows
//! up as end of stdout, which the slot reports as death.
//!
//! # Example
//!
//! ```ignore
//! use worker_launcher::{Launcher, transport::ProcessSpawner};
//!
//! let spawner = ProcessSpawner::new("/usr/lib/app/worker")?
//!     .with_arg("--service");
//! let launcher = Launcher::builder().spawner(spawner).capacity(4).build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{HostMessage, WorkerMessage, decode_line, encode_line};

use super::spawner::{ChildChannel, ChildSpawner, SpawnRequest};

// ============================================================================
// Constants
// ============================================================================

/// Flag carrying the slot index to the worker.
const SLOT_FLAG: &str = "--worker-slot";

// ============================================================================
// ProcessSpawner
// ============================================================================

/// Spawns workers as child processes of the launcher.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    /// Path to the worker executable.
    program: PathBuf,
    /// Arguments passed before the slot flag.
    args: Vec<String>,
    /// Extra environment variables.
    envs: Vec<(String, String)>,
}

impl ProcessSpawner {
    /// Creates a spawner for the given executable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an absolute path does not exist.
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        let program = program.into();
        if program.is_absolute() && !program.exists() {
            return Err(Error::config(format!(
                "Worker executable not found at: {}",
                program.display()
            )));
        }
        Ok(Self {
            program,
            args: Vec::new(),
            envs: Vec::new(),
        })
    }

    /// Adds an argument.
    #[inline]
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    #[inline]
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for every worker.
    #[inline]
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Returns the worker executable path.
    #[inline]
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Builds the argument list for a spawn request.
    #[must_use]
    pub fn to_args(&self, request: &SpawnRequest) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.extend(self.args.iter().cloned());
        args.push(format!("{SLOT_FLAG}={}", request.slot.get()));
        args
    }
}

#[async_trait]
impl ChildSpawner for ProcessSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn ChildChannel>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.to_args(&request));
        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        // Handshake over stdio, worker logs go to our stderr
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(Error::spawn_failed)?;
        let pid = child.id().unwrap_or(0);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::protocol("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::protocol("worker stdout not captured"))?;

        info!(pid, slot = %request.slot, "Worker process spawned");

        Ok(Box::new(ProcessChannel {
            child: Some(child),
            pid,
            stdin,
            lines: BufReader::new(stdout).lines(),
        }))
    }
}

// ============================================================================
// ProcessChannel
// ============================================================================

/// Handshake channel over a child's stdio.
struct ProcessChannel {
    /// The child process handle, taken on kill.
    child: Option<Child>,
    /// OS process id for logging.
    pid: u32,
    /// Launcher → worker.
    stdin: ChildStdin,
    /// Worker → launcher, line framed.
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl ChildChannel for ProcessChannel {
    async fn send(&mut self, message: &HostMessage) -> Result<()> {
        let line = encode_line(message)?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WorkerMessage>> {
        match self.lines.next_line().await {
            Ok(Some(line)) => Some(decode_line(&line)),
            Ok(None) => None,
            Err(e) => Some(Err(e.into())),
        }
    }

    async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Ok(Some(status)) = child.try_wait() {
                info!(pid = self.pid, status = %status, "Worker process exited");
                return;
            }
            debug!(pid = self.pid, "Killing worker process");
            if let Err(e) = child.kill().await {
                debug!(pid = self.pid, error = %e, "Failed to kill worker");
            }
            info!(pid = self.pid, "Worker process terminated");
        }
    }

    fn os_pid(&self) -> Option<u32> {
        (self.pid != 0).then_some(self.pid)
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            debug!(pid = self.pid, error = %e, "Failed to send kill signal in Drop");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use crate::identifiers::{CallerId, SlotIndex};
    use crate::launcher::{LaunchOptions, Launcher};
    use crate::protocol::{BindingStrength, SetupBundle, StartParams};

    const WAIT: Duration = Duration::from_secs(5);

    fn request(slot: usize) -> SpawnRequest {
        SpawnRequest {
            slot: SlotIndex::new(slot),
            binding: BindingStrength::Moderate,
        }
    }

    #[test]
    fn test_missing_absolute_program_rejected() {
        let result = ProcessSpawner::new("/nonexistent/worker");
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_to_args_appends_slot_flag() {
        let spawner = ProcessSpawner::new("worker")
            .expect("relative path accepted")
            .with_args(["--service", "--verbose"]);

        let args = spawner.to_args(&request(3));
        assert_eq!(args, vec!["--service", "--verbose", "--worker-slot=3"]);
    }

    #[test]
    fn test_with_env() {
        let spawner = ProcessSpawner::new("worker")
            .expect("relative path accepted")
            .with_env("RUST_LOG", "debug");
        assert_eq!(spawner.envs.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure() {
        let spawner = ProcessSpawner::new("definitely-not-a-worker-binary").expect("spawner");
        let result = spawner.spawn(request(0)).await;
        assert!(matches!(result, Err(Error::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_worker_handshake() {
        // Minimal worker: ack bind, ack setup with its own pid, exit on next line.
        let script = r#"read l; echo '{"type":"bound"}'; read l; echo "{\"type\":\"connected\",\"pid\":$$}"; read l"#;
        let spawner = ProcessSpawner::new("/bin/sh")
            .expect("sh exists")
            .with_args(["-c", script, "worker"]);

        let mut channel = spawner.spawn(request(0)).await.expect("spawn");
        let os_pid = channel.os_pid().expect("pid known");

        channel
            .send(&HostMessage::Bind {
                params: StartParams::new(CallerId::generate()),
            })
            .await
            .expect("send bind");
        assert_eq!(
            channel.recv().await.expect("message").expect("decode"),
            WorkerMessage::Bound
        );

        channel
            .send(&HostMessage::Setup {
                caller: CallerId::generate(),
                bundle: SetupBundle::default(),
            })
            .await
            .expect("send setup");
        match channel.recv().await.expect("message").expect("decode") {
            WorkerMessage::Connected { pid } => assert_eq!(pid.as_u32(), os_pid),
            other => panic!("unexpected message: {other:?}"),
        }

        channel.send(&HostMessage::Shutdown).await.expect("send shutdown");
        assert!(channel.recv().await.is_none());
        channel.kill().await;
    }

    #[cfg(unix)]
    fn shell_launcher(script: &str, grace: Duration) -> (Launcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mark = dir.path().join("teardown.done");
        let spawner = ProcessSpawner::new("/bin/sh")
            .expect("sh exists")
            .with_args(["-c", script, "worker"])
            .with_env("MARK", mark.to_string_lossy());
        let launcher = Launcher::builder()
            .spawner(spawner)
            .capacity(1)
            .free_delay(Duration::ZERO)
            .shutdown_grace(grace)
            .build()
            .expect("launcher");
        (launcher, dir)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_lets_worker_finish_teardown() {
        // Teardown after `shutdown` takes a moment, then leaves a mark.
        let script = r#"read l; echo '{"type":"bound"}'; read l; echo "{\"type\":\"connected\",\"pid\":$$}"; read l; sleep 0.05; touch "$MARK""#;
        let (launcher, dir) = shell_launcher(script, Duration::from_secs(2));
        let mark = dir.path().join("teardown.done");

        let handle = launcher
            .launch(LaunchOptions::new(["--type=worker"]))
            .await
            .expect("launch");
        timeout(WAIT, handle.wait_ready())
            .await
            .expect("ready in time")
            .expect("ready");
        handle.stop().await.expect("stop");

        timeout(WAIT, async {
            while !mark.exists() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("teardown completed before kill");

        launcher.shutdown().await.expect("shutdown");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_worker_ignoring_shutdown_is_killed() {
        let script = r#"read l; echo '{"type":"bound"}'; read l; echo "{\"type\":\"connected\",\"pid\":$$}"; read l; exec sleep 30"#;
        let (launcher, _dir) = shell_launcher(script, Duration::from_millis(100));

        let handle = launcher
            .launch(LaunchOptions::new(["--type=worker"]))
            .await
            .expect("launch");
        let pid = timeout(WAIT, handle.wait_ready())
            .await
            .expect("ready in time")
            .expect("ready");
        handle.stop().await.expect("stop");

        let proc_entry = PathBuf::from(format!("/proc/{pid}"));
        timeout(WAIT, async {
            while proc_entry.exists() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker killed after grace period");

        launcher.shutdown().await.expect("shutdown");
    }
}
