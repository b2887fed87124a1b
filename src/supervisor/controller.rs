//! The single-slot worker supervisor.
//!
//! A `Supervisor` owns at most one current worker. Manual `start`/`reconnect` calls and
//! liveness-triggered relaunches all go through one async mutex, so two paths can never
//! each spawn a worker and orphan the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::supervisor::monitor::{LivenessMonitor, MonitorHandle, DEFAULT_POLL_INTERVAL_SECS};
use crate::worker::{
    LogSink, OutputRelay, ProcessLauncher, RelayHandle, TerminateOutcome, WorkerDescriptor,
    WorkerHandle,
};
use crate::{rlog, rlog_debug, rlog_error, rlog_warn, Error, Result};

pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
const DEFAULT_RELAY_JOIN_MILLIS: u64 = 1000;
const BEST_EFFORT_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle of the supervised slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorStatus {
    Idle,
    Starting,
    Running,
    Dead,
    Restarting,
    Stopped,
}

impl std::fmt::Display for SupervisorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SupervisorStatus::Idle => "idle",
            SupervisorStatus::Starting => "starting",
            SupervisorStatus::Running => "running",
            SupervisorStatus::Dead => "dead",
            SupervisorStatus::Restarting => "restarting",
            SupervisorStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Timing knobs for a [`Supervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Period between liveness checks.
    pub poll_interval: Duration,
    /// How long a superseded worker gets to exit after SIGTERM.
    pub stop_grace: Duration,
    /// How long `shutdown` waits for the monitor before aborting it.
    pub shutdown_grace: Duration,
    /// How long a superseded worker's relay may keep draining.
    pub relay_join: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            relay_join: Duration::from_millis(DEFAULT_RELAY_JOIN_MILLIS),
        }
    }
}

/// What a caller learns from a successful start or reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub target_id: String,
    pub pid: Option<u32>,
    pub generation: Uuid,
}

/// How hard to wait for the previous worker when replacing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    /// Signal, wait at most a second, kill if needed, move on.
    BestEffort,
    /// Signal and wait the full stop grace; a worker that outlives it is reported.
    AwaitExit,
}

struct Worker {
    handle: Arc<WorkerHandle>,
    relay: RelayHandle,
}

struct SupervisorState {
    status: SupervisorStatus,
    current: Option<Worker>,
    descriptor: Option<WorkerDescriptor>,
    monitor: Option<MonitorHandle>,
}

/// Owns one external worker and keeps it running.
pub struct Supervisor {
    launcher: ProcessLauncher,
    relay: OutputRelay,
    sink: Arc<dyn LogSink>,
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    restarts: AtomicU64,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("launcher", &self.launcher)
            .field("config", &self.config)
            .field("restarts", &self.restart_count())
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        launcher: ProcessLauncher,
        config: SupervisorConfig,
        sink: Arc<dyn LogSink>,
    ) -> Arc<Self> {
        Self::with_relay(launcher, OutputRelay::default(), config, sink)
    }

    pub fn with_relay(
        launcher: ProcessLauncher,
        relay: OutputRelay,
        config: SupervisorConfig,
        sink: Arc<dyn LogSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            relay,
            sink,
            config,
            state: Mutex::new(SupervisorState {
                status: SupervisorStatus::Idle,
                current: None,
                descriptor: None,
                monitor: None,
            }),
            restarts: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub async fn status(&self) -> SupervisorStatus {
        self.state.lock().await.status
    }

    /// Number of liveness-triggered relaunches so far.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub async fn current_target(&self) -> Option<String> {
        let state = self.state.lock().await;
        state
            .current
            .as_ref()
            .map(|w| w.handle.target_id().to_string())
    }

    pub async fn current_pid(&self) -> Option<u32> {
        let state = self.state.lock().await;
        state.current.as_ref().and_then(|w| w.handle.pid())
    }

    pub async fn current_generation(&self) -> Option<Uuid> {
        let state = self.state.lock().await;
        state.current.as_ref().map(|w| w.handle.generation())
    }

    /// Whether the current worker is running. False when there is none.
    pub async fn is_alive(&self) -> bool {
        let handle = {
            let state = self.state.lock().await;
            state.current.as_ref().map(|w| Arc::clone(&w.handle))
        };
        match handle {
            Some(handle) => handle.is_alive().unwrap_or(false),
            None => false,
        }
    }

    /// Launch a worker for `descriptor`, replacing the current one if any.
    ///
    /// The previous worker gets SIGTERM and a short grace before being killed. The
    /// first successful start also schedules liveness polling.
    pub async fn start(self: &Arc<Self>, descriptor: WorkerDescriptor) -> Result<StartOutcome> {
        rlog!("Supervisor::start {}", descriptor);
        self.replace_detached(descriptor, Handoff::BestEffort).await
    }

    /// Stop the current worker, waiting for it to exit, then launch `descriptor`.
    ///
    /// A worker still alive after the grace period is logged and the new one is
    /// launched anyway, so two workers may coexist for a moment.
    pub async fn reconnect(
        self: &Arc<Self>,
        descriptor: WorkerDescriptor,
    ) -> Result<StartOutcome> {
        rlog!("Supervisor::reconnect {}", descriptor);
        self.replace_detached(descriptor, Handoff::AwaitExit).await
    }

    /// Run the handoff on its own task.
    ///
    /// The caller may drop its future (a timeout, a disconnected client); the swap still
    /// runs to completion so the slot never stays half-replaced.
    async fn replace_detached(
        self: &Arc<Self>,
        descriptor: WorkerDescriptor,
        handoff: Handoff,
    ) -> Result<StartOutcome> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.replace(descriptor, handoff).await })
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }

    async fn replace(
        self: &Arc<Self>,
        descriptor: WorkerDescriptor,
        handoff: Handoff,
    ) -> Result<StartOutcome> {
        descriptor.validate()?;

        let mut state = self.state.lock().await;
        if state.status == SupervisorStatus::Stopped {
            return Err(Error::SupervisorStopped);
        }
        state.status = SupervisorStatus::Starting;

        let outcome = self.swap_worker(&mut state, descriptor, handoff).await?;

        if state.monitor.is_none() {
            state.monitor = Some(self.schedule_monitor());
        }
        Ok(outcome)
    }

    /// Retire the current worker and launch a new one. Caller holds the lock.
    async fn swap_worker(
        &self,
        state: &mut SupervisorState,
        descriptor: WorkerDescriptor,
        handoff: Handoff,
    ) -> Result<StartOutcome> {
        if let Some(old) = state.current.take() {
            self.retire(old, handoff).await;
        }

        let handle = match self.launcher.launch(&descriptor) {
            Ok(handle) => handle,
            Err(e) => {
                rlog_error!("failed to launch worker {}: {}", descriptor, e);
                if state.monitor.is_some() {
                    // Keep the descriptor so the next liveness tick retries it.
                    state.descriptor = Some(descriptor);
                    state.status = SupervisorStatus::Dead;
                } else {
                    state.status = SupervisorStatus::Idle;
                }
                return Err(e);
            }
        };

        let relay = self.relay.attach(&handle, Arc::clone(&self.sink));
        let outcome = StartOutcome {
            target_id: handle.target_id().to_string(),
            pid: handle.pid(),
            generation: handle.generation(),
        };
        rlog!(
            "worker {} running (pid {:?}, generation {})",
            outcome.target_id,
            outcome.pid,
            outcome.generation
        );

        state.current = Some(Worker {
            handle: Arc::new(handle),
            relay,
        });
        state.descriptor = Some(descriptor);
        state.status = SupervisorStatus::Running;
        Ok(outcome)
    }

    async fn retire(&self, old: Worker, handoff: Handoff) {
        let target = old.handle.target_id().to_string();
        rlog_debug!(
            "retiring worker {} (pid {:?}, up {:?})",
            target,
            old.handle.pid(),
            old.handle.uptime()
        );

        let grace = match handoff {
            Handoff::BestEffort => self.config.stop_grace.min(BEST_EFFORT_WAIT),
            Handoff::AwaitExit => self.config.stop_grace,
        };
        match old.handle.terminate(grace).await {
            TerminateOutcome::AlreadyExited | TerminateOutcome::Graceful => {}
            TerminateOutcome::Killed if handoff == Handoff::AwaitExit => rlog_warn!(
                "previous worker {} did not exit within {:?}; it was killed",
                target,
                grace
            ),
            TerminateOutcome::Killed => {}
            TerminateOutcome::StillRunning => rlog_warn!(
                "previous worker {} is still running after SIGKILL; launching replacement anyway",
                target
            ),
        }

        old.relay.finish(self.config.relay_join).await;
    }

    fn schedule_monitor(self: &Arc<Self>) -> MonitorHandle {
        let check_ref: Weak<Self> = Arc::downgrade(self);
        let relaunch_ref: Weak<Self> = Arc::downgrade(self);

        LivenessMonitor::new(self.config.poll_interval).schedule(
            move || {
                let supervisor = check_ref.clone();
                async move {
                    match supervisor.upgrade() {
                        Some(s) => s.liveness_check(),
                        None => true,
                    }
                }
            },
            move || {
                let supervisor = relaunch_ref.clone();
                async move {
                    match supervisor.upgrade() {
                        Some(s) => s.relaunch_dead().await,
                        None => Ok(()),
                    }
                }
            },
        )
    }

    /// One liveness tick. Holds the state lock only long enough to clone the handle.
    fn liveness_check(&self) -> bool {
        let handle = {
            let Ok(state) = self.state.try_lock() else {
                // A start, reconnect or shutdown is in progress and owns the worker.
                rlog_debug!("liveness check skipped: supervisor busy");
                return true;
            };
            match state.status {
                SupervisorStatus::Running | SupervisorStatus::Dead => {}
                _ => return true,
            }
            state.current.as_ref().map(|w| Arc::clone(&w.handle))
        };

        let Some(handle) = handle else {
            return false;
        };
        match handle.is_alive() {
            Ok(alive) => {
                rlog_debug!("liveness check {}: alive={}", handle.target_id(), alive);
                alive
            }
            Err(e) => {
                rlog_warn!(
                    "liveness check for {} failed, treating as dead: {}",
                    handle.target_id(),
                    e
                );
                false
            }
        }
    }

    /// Relaunch with the stored descriptor after a failed liveness check.
    async fn relaunch_dead(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.status {
            SupervisorStatus::Running | SupervisorStatus::Dead => {}
            other => {
                rlog_debug!("relaunch skipped: supervisor is {}", other);
                return Ok(());
            }
        }

        // A manual reconnect may have replaced the worker since the check.
        if let Some(current) = &state.current {
            if current.handle.is_alive().unwrap_or(false) {
                rlog_debug!("relaunch skipped: worker {} is alive", current.handle.target_id());
                return Ok(());
            }
            if let Ok(Some(status)) = current.handle.exit_status() {
                rlog_warn!("worker {} exited with {}", current.handle.target_id(), status);
            }
        }

        let Some(descriptor) = state.descriptor.clone() else {
            return Ok(());
        };

        state.status = SupervisorStatus::Dead;
        rlog_warn!("worker {} is dead; relaunching", descriptor.target_id());
        state.status = SupervisorStatus::Restarting;
        self.restarts.fetch_add(1, Ordering::SeqCst);

        self.swap_worker(&mut state, descriptor, Handoff::BestEffort)
            .await
            .map(|_| ())
    }

    /// Stop polling, terminate the current worker, and refuse further starts.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let monitor = {
            let mut state = self.state.lock().await;
            if state.status == SupervisorStatus::Stopped {
                return;
            }
            rlog!("Supervisor::shutdown from {}", state.status);
            state.status = SupervisorStatus::Stopped;
            state.monitor.take()
        };

        // Lock released: an in-flight relaunch can finish and observe Stopped.
        if let Some(monitor) = monitor {
            if !monitor.cancel(self.config.shutdown_grace).await {
                rlog_warn!("liveness monitor was aborted during shutdown");
            }
        }

        let current = self.state.lock().await.current.take();
        if let Some(worker) = current {
            self.retire(worker, Handoff::AwaitExit).await;
        }
        rlog!("Supervisor stopped");
    }
}
