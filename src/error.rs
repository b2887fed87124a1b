use thiserror::Error;

/// Why a worker launch attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailure {
    /// The binary is missing or the OS refused to create the process.
    SpawnFailed,
    /// The configured working directory does not exist.
    WorkingDir,
}

impl LaunchFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchFailure::SpawnFailed => "spawn-failed",
            LaunchFailure::WorkingDir => "working-dir-missing",
        }
    }
}

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid connection URI: {0}")]
    Url(#[from] url::ParseError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid worker descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("{reason}: could not launch '{binary}': {source}")]
    Launch {
        reason: LaunchFailure,
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Supervisor has been shut down")]
    SupervisorStopped,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Supervisor task failed: {0}")]
    TaskJoin(String),
}

impl Error {
    /// True for failures to create the worker process itself.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Error::Launch { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
