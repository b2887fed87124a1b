pub mod config;
pub mod error;
pub mod log;
pub mod service;
pub mod supervisor;
pub mod worker;

pub use error::{Error, LaunchFailure, Result};
pub use service::{
    ChannelInfo, ChannelProvisioner, LocalChannels, StreamRequest, StreamResponse, StreamService,
};
pub use supervisor::{
    LivenessMonitor, MonitorHandle, StartOutcome, Supervisor, SupervisorConfig, SupervisorStatus,
};
pub use worker::{
    CameraSource, Credentials, FileLogSink, LaunchSettings, LogSink, OutputRelay,
    ProcessLauncher, WorkerDescriptor, WorkerHandle,
};
