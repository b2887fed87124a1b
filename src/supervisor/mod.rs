//! Supervision of the external worker: liveness polling and the single-slot
//! supervisor that relaunches the worker when it dies.

mod controller;
mod monitor;

pub use controller::{
    StartOutcome, Supervisor, SupervisorConfig, SupervisorStatus, DEFAULT_SHUTDOWN_GRACE_SECS,
    DEFAULT_STOP_GRACE_SECS,
};
pub use monitor::{LivenessMonitor, MonitorHandle, DEFAULT_POLL_INTERVAL_SECS};
