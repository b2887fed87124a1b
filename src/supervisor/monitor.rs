//! Fixed-interval liveness polling.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{rlog_debug, rlog_error, rlog_warn, Result};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Polls a liveness check and runs a recovery action when it fails.
///
/// Retries are unbounded and never back off: every tick that finds the worker dead
/// gets exactly one `on_dead` call.
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    interval: Duration,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS))
    }
}

impl LivenessMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling. The first check runs one full interval from now.
    ///
    /// `on_dead` runs in its own task and is awaited before the next tick, so a slow
    /// relaunch delays polling instead of stacking up concurrent relaunches. Errors and
    /// panics from it are logged and polling continues.
    pub fn schedule<C, CF, D, DF>(&self, check: C, on_dead: D) -> MonitorHandle
    where
        C: Fn() -> CF + Send + 'static,
        CF: Future<Output = bool> + Send + 'static,
        D: Fn() -> DF + Send + 'static,
        DF: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.interval;

        rlog_debug!("LivenessMonitor::schedule interval={:?}", period);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if check().await {
                    continue;
                }
                if token.is_cancelled() {
                    break;
                }

                rlog_warn!("worker is not alive; attempting to relaunch");
                let mut relaunch = AbortOnDrop(tokio::spawn(on_dead()));
                match (&mut relaunch.0).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => rlog_error!("failed to relaunch worker: {}", e),
                    Err(e) => rlog_error!("relaunch task failed: {}", e),
                }
            }
            rlog_debug!("LivenessMonitor stopped");
        });

        MonitorHandle {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Aborts the relaunch task if the polling loop itself is aborted mid-await.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Cancellation handle for a scheduled [`LivenessMonitor`].
///
/// Dropping it cancels polling without waiting.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop polling, waiting up to `grace` for an in-flight check or relaunch.
    ///
    /// Returns false if the loop had to be aborted. Calling it again is a no-op.
    pub async fn cancel(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut task) = task else {
            return true;
        };

        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                rlog_warn!("liveness monitor did not stop within {:?}; aborting", grace);
                task.abort();
                false
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
