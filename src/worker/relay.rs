//! Draining worker output into the log.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::worker::{OutputStream, WorkerHandle};
use crate::{rlog, rlog_debug, rlog_error, rlog_trace, rlog_warn};

pub const DEFAULT_RELAY_TAG: &str = "[GStreamer]";

/// Where relayed worker output goes.
pub trait LogSink: Send + Sync {
    fn info(&self, line: &str);
    fn error(&self, line: &str);
}

/// Forwards worker output to the crate log file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLogSink;

impl LogSink for FileLogSink {
    fn info(&self, line: &str) {
        rlog!("{}", line);
    }

    fn error(&self, line: &str) {
        rlog_error!("{}", line);
    }
}

/// Attaches a background reader to a worker's combined output stream.
#[derive(Debug, Clone)]
pub struct OutputRelay {
    tag: String,
}

impl Default for OutputRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_TAG)
    }
}

impl OutputRelay {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Start forwarding `handle`'s output to `sink`. Returns immediately.
    ///
    /// The task ends on EOF or on the first read error; it never restarts itself.
    pub fn attach(&self, handle: &WorkerHandle, sink: Arc<dyn LogSink>) -> RelayHandle {
        let generation = handle.generation();
        let Some(output) = handle.take_output() else {
            rlog_warn!(
                "OutputRelay::attach: output of worker {} already taken",
                handle.target_id()
            );
            return RelayHandle {
                generation,
                task: None,
            };
        };
        self.attach_stream(generation, handle.target_id(), output, sink)
    }

    pub(crate) fn attach_stream(
        &self,
        generation: Uuid,
        target: &str,
        mut output: OutputStream,
        sink: Arc<dyn LogSink>,
    ) -> RelayHandle {
        let tag = self.tag.clone();
        let target = target.to_string();
        rlog_debug!("OutputRelay::attach worker={} generation={}", target, generation);

        let task = tokio::spawn(async move {
            let mut lines = 0u64;
            while let Some(item) = output.next().await {
                match item {
                    Ok(line) => {
                        sink.info(&format!("{} {}", tag, line));
                        lines += 1;
                    }
                    Err(e) => {
                        sink.error(&format!("{} output read failed for {}: {}", tag, target, e));
                        break;
                    }
                }
            }
            rlog_trace!("relay for {} finished after {} lines", target, lines);
            lines
        });

        RelayHandle {
            generation,
            task: Some(task),
        }
    }
}

/// Ownership of one relay task, tied to the worker generation it drains.
#[derive(Debug)]
pub struct RelayHandle {
    generation: Uuid,
    task: Option<JoinHandle<u64>>,
}

impl RelayHandle {
    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Join the relay, abandoning it if it is still draining after `bound`.
    ///
    /// Returns the number of lines relayed when the task finished in time.
    pub async fn finish(mut self, bound: Duration) -> Option<u64> {
        let mut task = self.task.take()?;
        match tokio::time::timeout(bound, &mut task).await {
            Ok(Ok(lines)) => Some(lines),
            Ok(Err(e)) => {
                rlog_error!("relay task for generation {} failed: {}", self.generation, e);
                None
            }
            Err(_) => {
                rlog_debug!(
                    "relay for generation {} still draining after {:?}; abandoning",
                    self.generation,
                    bound
                );
                task.abort();
                None
            }
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
