//! The external media worker: what to launch, how to launch it, and where its
//! output goes.

mod descriptor;
mod launcher;
mod relay;

pub use descriptor::{
    redact_uri, CameraSource, Credentials, WorkerDescriptor, ACCESS_KEY_ID_VAR,
    DEFAULT_RTSP_PATH, DEFAULT_RTSP_PORT, REGION_VAR, SECRET_ACCESS_KEY_VAR,
};
pub use launcher::{
    LaunchSettings, OutputStream, ProcessLauncher, TerminateOutcome, WorkerHandle,
    DEFAULT_BINARY, DEFAULT_MEDIA_MODE, DEFAULT_SOURCE_TYPE, DEFAULT_WORKING_DIR,
};
pub use relay::{FileLogSink, LogSink, OutputRelay, RelayHandle, DEFAULT_RELAY_TAG};

pub(crate) use launcher::expand_tilde;
