//! Spawning and terminating the external media worker.
//!
//! The worker is invoked as
//! `<binary> <target_id> <media_mode> <source_type> <connection_uri>` from a fixed
//! working directory, with the descriptor environment layered over the inherited one.
//! Its stdout and stderr are merged into a single line stream.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::error::LaunchFailure;
use crate::worker::WorkerDescriptor;
use crate::{rlog_debug, rlog_warn, Error, Result};

pub const DEFAULT_BINARY: &str = "./kvsWebrtcClientMasterGstSample";
pub const DEFAULT_WORKING_DIR: &str = "~/amazon-kinesis-video-streams-webrtc-sdk-c/build/samples";
pub const DEFAULT_MEDIA_MODE: &str = "video-only";
pub const DEFAULT_SOURCE_TYPE: &str = "rtspsrc";

const EXIT_POLL: Duration = Duration::from_millis(50);
const KILL_REAP_BOUND: Duration = Duration::from_secs(1);

/// Combined stdout+stderr of a worker, one item per line.
pub type OutputStream = BoxStream<'static, io::Result<String>>;

/// Fixed parts of the worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    pub binary: String,
    pub working_dir: PathBuf,
    pub media_mode: String,
    pub source_type: String,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            working_dir: expand_tilde(DEFAULT_WORKING_DIR),
            media_mode: DEFAULT_MEDIA_MODE.to_string(),
            source_type: DEFAULT_SOURCE_TYPE.to_string(),
        }
    }
}

impl LaunchSettings {
    pub fn new(binary: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Path the OS will actually execute.
    ///
    /// Relative paths such as `./sample` are resolved against the working directory,
    /// bare names are left for `PATH` lookup.
    pub fn resolved_binary(&self) -> PathBuf {
        let binary = Path::new(&self.binary);
        let bare_name = binary.components().count() == 1 && !self.binary.starts_with('.');
        if binary.is_absolute() || bare_name {
            binary.to_path_buf()
        } else {
            self.working_dir.join(binary)
        }
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// How a worker went away when asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Had already exited before we signalled it.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Ignored SIGTERM and was killed.
    Killed,
    /// Still running even after SIGKILL and the reap bound.
    StillRunning,
}

impl TerminateOutcome {
    pub fn exited_gracefully(&self) -> bool {
        matches!(self, TerminateOutcome::AlreadyExited | TerminateOutcome::Graceful)
    }
}

/// A running worker process, owned exclusively by whoever launched it.
///
/// Dropping the handle kills the process.
pub struct WorkerHandle {
    generation: Uuid,
    target_id: String,
    pid: Option<u32>,
    started_at: Instant,
    child: Mutex<Child>,
    output: Mutex<Option<OutputStream>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("generation", &self.generation)
            .field("target_id", &self.target_id)
            .field("pid", &self.pid)
            .finish()
    }
}

impl WorkerHandle {
    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Take the combined output stream. Only the first call gets it.
    pub fn take_output(&self) -> Option<OutputStream> {
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn child(&self) -> MutexGuard<'_, Child> {
        self.child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Non-blocking liveness query.
    pub fn is_alive(&self) -> Result<bool> {
        Ok(self.child().try_wait()?.is_none())
    }

    /// Exit status, if the worker has exited.
    pub fn exit_status(&self) -> Result<Option<ExitStatus>> {
        Ok(self.child().try_wait()?)
    }

    /// Ask the worker to stop. Returns false if it had already exited.
    pub fn signal_terminate(&self) -> Result<bool> {
        let mut child = self.child();
        if child.try_wait()?.is_some() {
            return Ok(false);
        }
        // Signalled while holding the lock so the pid cannot be reaped and reused underneath us.
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|e| Error::Io(io::Error::from(e)))?;
                return Ok(true);
            }
        }
        child.start_kill()?;
        Ok(true)
    }

    /// Force the worker down without waiting.
    pub fn kill(&self) -> Result<()> {
        let mut child = self.child();
        if child.try_wait()?.is_none() {
            child.start_kill()?;
        }
        Ok(())
    }

    /// Poll until the worker exits or `bound` elapses. Returns whether it exited.
    pub async fn wait_exit(&self, bound: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            match self.is_alive() {
                Ok(false) => return true,
                Ok(true) => {}
                Err(e) => {
                    rlog_warn!("worker {} exit poll failed: {}", self.target_id, e);
                    return false;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL as a safety net.
    pub async fn terminate(&self, grace: Duration) -> TerminateOutcome {
        match self.signal_terminate() {
            Ok(false) => return TerminateOutcome::AlreadyExited,
            Ok(true) => {}
            Err(e) => rlog_warn!("worker {} SIGTERM failed: {}", self.target_id, e),
        }

        if self.wait_exit(grace).await {
            rlog_debug!("worker {} (pid {:?}) exited gracefully", self.target_id, self.pid);
            return TerminateOutcome::Graceful;
        }

        rlog_warn!(
            "worker {} (pid {:?}) ignored SIGTERM for {:?}; killing",
            self.target_id,
            self.pid,
            grace
        );
        if let Err(e) = self.kill() {
            rlog_warn!("worker {} SIGKILL failed: {}", self.target_id, e);
        }
        if self.wait_exit(KILL_REAP_BOUND).await {
            TerminateOutcome::Killed
        } else {
            TerminateOutcome::StillRunning
        }
    }
}

/// Builds and starts worker processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    settings: LaunchSettings,
}

impl ProcessLauncher {
    pub fn new(settings: LaunchSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LaunchSettings {
        &self.settings
    }

    /// Whether the worker binary can be found right now.
    pub fn binary_available(&self) -> bool {
        let resolved = self.settings.resolved_binary();
        if resolved.components().count() == 1 {
            which::which(&resolved).is_ok()
        } else {
            resolved.is_file()
        }
    }

    /// Positional arguments passed to the worker binary.
    pub fn arguments(&self, descriptor: &WorkerDescriptor) -> [String; 4] {
        [
            descriptor.target_id().to_string(),
            self.settings.media_mode.clone(),
            self.settings.source_type.clone(),
            descriptor.connection_uri().to_string(),
        ]
    }

    /// Spawn one worker for `descriptor`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(&self, descriptor: &WorkerDescriptor) -> Result<WorkerHandle> {
        descriptor.validate()?;

        let binary = self.settings.resolved_binary();
        let binary_display = binary.display().to_string();

        if !self.settings.working_dir.is_dir() {
            return Err(Error::Launch {
                reason: LaunchFailure::WorkingDir,
                binary: binary_display,
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!(
                        "working directory {} does not exist",
                        self.settings.working_dir.display()
                    ),
                ),
            });
        }

        rlog_debug!(
            "ProcessLauncher::launch binary={} cwd={} descriptor={:?}",
            binary_display,
            self.settings.working_dir.display(),
            descriptor
        );

        let mut child = Command::new(&binary)
            .args(self.arguments(descriptor))
            .current_dir(&self.settings.working_dir)
            .envs(descriptor.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Launch {
                reason: LaunchFailure::SpawnFailed,
                binary: binary_display.clone(),
                source,
            })?;

        let pid = child.id();
        let output = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => stream::select(line_stream(out), line_stream(err)).boxed(),
            (Some(out), None) => line_stream(out),
            (None, Some(err)) => line_stream(err),
            (None, None) => stream::empty().boxed(),
        };

        rlog_debug!("worker {} spawned with pid {:?}", descriptor.target_id(), pid);

        Ok(WorkerHandle {
            generation: Uuid::new_v4(),
            target_id: descriptor.target_id().to_string(),
            pid,
            started_at: Instant::now(),
            child: Mutex::new(child),
            output: Mutex::new(Some(output)),
        })
    }
}

/// Lines of `reader`, decoded lossily so stray non-UTF-8 bytes never end the stream.
fn line_stream<R>(reader: R) -> OutputStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(BufReader::new(reader)), |state| async move {
        let mut reader = state?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                Some((Ok(String::from_utf8_lossy(&buf).into_owned()), Some(reader)))
            }
            // Yield the error once, then end.
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}
