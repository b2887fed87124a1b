use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::{
    SupervisorConfig, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SHUTDOWN_GRACE_SECS,
    DEFAULT_STOP_GRACE_SECS,
};
use crate::worker::{
    expand_tilde, Credentials, LaunchSettings, ACCESS_KEY_ID_VAR, DEFAULT_BINARY,
    DEFAULT_MEDIA_MODE, DEFAULT_SOURCE_TYPE, DEFAULT_WORKING_DIR, REGION_VAR,
    SECRET_ACCESS_KEY_VAR,
};
use crate::{rlog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub launcher: LauncherSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LauncherSection {
    pub binary: Option<String>,
    pub working_dir: Option<String>,
    pub media_mode: Option<String>,
    pub source_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SupervisorSection {
    pub poll_interval_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

/// Passed through to the worker untouched.
#[derive(Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CredentialsSection {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
}

impl std::fmt::Debug for CredentialsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsSection")
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "***"),
            )
            .field("region", &self.region)
            .finish()
    }
}

impl Config {
    pub fn relay_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".kvs-relay"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::relay_dir()?.join("relay.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        rlog_debug!(
            "Config loaded: launcher={:?}, supervisor={:?}",
            config.launcher,
            config.supervisor
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                rlog_debug!("Creating config directory {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor.poll_interval_secs == Some(0) {
            return Err(Error::Validation(
                "supervisor.poll_interval_secs must be positive".to_string(),
            ));
        }
        if matches!(self.launcher.binary.as_deref(), Some(b) if b.trim().is_empty()) {
            return Err(Error::Validation("launcher.binary cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn launch_settings(&self) -> LaunchSettings {
        let l = &self.launcher;
        LaunchSettings {
            binary: l.binary.clone().unwrap_or_else(|| DEFAULT_BINARY.to_string()),
            working_dir: expand_tilde(l.working_dir.as_deref().unwrap_or(DEFAULT_WORKING_DIR)),
            media_mode: l
                .media_mode
                .clone()
                .unwrap_or_else(|| DEFAULT_MEDIA_MODE.to_string()),
            source_type: l
                .source_type
                .clone()
                .unwrap_or_else(|| DEFAULT_SOURCE_TYPE.to_string()),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let s = &self.supervisor;
        SupervisorConfig {
            poll_interval: Duration::from_secs(
                s.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            stop_grace: Duration::from_secs(s.stop_grace_secs.unwrap_or(DEFAULT_STOP_GRACE_SECS)),
            shutdown_grace: Duration::from_secs(
                s.shutdown_grace_secs.unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
            ..SupervisorConfig::default()
        }
    }

    /// File values first, then the usual environment variables, then empty.
    pub fn credentials(&self) -> Credentials {
        self.credentials_with(|key| std::env::var(key).ok())
    }

    fn credentials_with(&self, env: impl Fn(&str) -> Option<String>) -> Credentials {
        let c = &self.credentials;
        let pick = |value: &Option<String>, key: &str| {
            value.clone().or_else(|| env(key)).unwrap_or_default()
        };
        Credentials {
            access_key_id: pick(&c.access_key_id, ACCESS_KEY_ID_VAR),
            secret_access_key: pick(&c.secret_access_key, SECRET_ACCESS_KEY_VAR),
            region: pick(&c.region, REGION_VAR),
        }
    }

    /// The config as TOML with the secret key masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.credentials.secret_access_key.is_some() {
            shown.credentials.secret_access_key = Some("***".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}
