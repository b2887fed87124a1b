//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating a temporary worker directory with stub worker scripts
//! - Building supervisors with short timings
//! - Recording relayed output
//! - Killing and probing worker processes out-of-band

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tokio::time::Instant;

use kvs_relay::{LaunchSettings, LogSink, ProcessLauncher, Supervisor, SupervisorConfig};

pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// A stub worker that announces itself and then keeps producing output.
pub const LOOPING_WORKER: &str = r#"echo "started $0 $1 $2"
echo "uri=$3"
echo "region=$AWS_DEFAULT_REGION"
while true; do echo tick; sleep 0.1; done
"#;

/// A stub worker that ignores SIGTERM.
pub const STUBBORN_WORKER: &str = r#"trap '' TERM
echo "started $0"
while true; do sleep 0.1; done
"#;

/// A stub worker that dies right away.
pub const CRASHING_WORKER: &str = r#"echo "started $0"
echo "connection refused" >&2
exit 1
"#;

/// A temporary directory the launcher uses as its working directory.
pub struct WorkerDir {
    /// Kept alive for the duration of the test.
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl WorkerDir {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        Self { temp_dir, path }
    }

    /// Write the script `/bin/sh` will run for `target_id`.
    pub fn add_worker(&self, target_id: &str, script: &str) {
        std::fs::write(self.path.join(target_id), script).expect("Failed to write worker script");
    }

    pub fn launcher(&self) -> ProcessLauncher {
        ProcessLauncher::new(LaunchSettings::new("/bin/sh", &self.path))
    }

    pub fn supervisor(&self, sink: Arc<dyn LogSink>) -> Arc<Supervisor> {
        self.supervisor_with(fast_config(), sink)
    }

    pub fn supervisor_with(
        &self,
        config: SupervisorConfig,
        sink: Arc<dyn LogSink>,
    ) -> Arc<Supervisor> {
        Supervisor::new(self.launcher(), config, sink)
    }
}

pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        poll_interval: POLL_INTERVAL,
        stop_grace: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(2),
        relay_join: Duration::from_millis(500),
    }
}

/// Collects relayed lines in memory.
#[derive(Default)]
pub struct RecordingSink {
    info: Mutex<Vec<String>>,
    error: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.info.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.error.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.info
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains(needle))
            .count()
    }
}

impl LogSink for RecordingSink {
    fn info(&self, line: &str) {
        self.info.lock().unwrap().push(line.to_string());
    }

    fn error(&self, line: &str) {
        self.error.lock().unwrap().push(line.to_string());
    }
}

/// SIGKILL a worker behind the supervisor's back.
pub fn kill_out_of_band(pid: u32) {
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).expect("Failed to kill worker");
}

/// Whether a process with `pid` exists (zombies included).
pub fn pid_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Poll `condition` every 50ms until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
