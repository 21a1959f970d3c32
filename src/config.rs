//! Agent configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) works.
//!
//! ```json
//! {
//!   "service_name": "checkout",
//!   "executable": "/usr/local/bin/checkout",
//!   "pid": 4242,
//!   "catalog_path": "/etc/autoprobe/catalog.json",
//!   "offsets_path": "/var/lib/autoprobe/checkout.offsets.json",
//!   "attach_policy": "require_any"
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ebpf::AttachPolicy;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "AUTOPROBE_CONFIG";

/// Configuration for the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Service name put on every span
    pub service_name: String,
    pub service_namespace: Option<String>,
    /// OTLP endpoint for the agent's own traces (None = console logs only)
    pub otlp_endpoint: Option<String>,
    /// tracing-subscriber filter used when RUST_LOG is unset
    pub log_filter: String,
    pub attach_policy: AttachPolicy,
    /// Executable to attach user probes to
    pub executable: Option<PathBuf>,
    /// Restrict user probes to one process
    pub pid: Option<i32>,
    /// Compiled eBPF object holding the catalog's programs
    pub object_path: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub offsets_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: "autoprobe".to_string(),
            service_namespace: None,
            otlp_endpoint: None,
            log_filter: crate::telemetry::DEFAULT_LOG_FILTER.to_string(),
            attach_policy: AttachPolicy::BestEffort,
            executable: None,
            pid: None,
            object_path: None,
            catalog_path: None,
            offsets_path: None,
        }
    }
}

/// Error type for configuration and input files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io { path: PathBuf, reason: String },
    Parse { path: PathBuf, reason: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, reason } => write!(f, "reading {}: {}", path.display(), reason),
            ConfigError::Parse { path, reason } => write!(f, "parsing {}: {}", path.display(), reason),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Config from the file named by `AUTOPROBE_CONFIG`, or defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service_name must not be empty".into()));
        }
        if self.pid.is_some_and(|pid| pid <= 0) {
            return Err(ConfigError::Invalid("pid must be positive".into()));
        }
        Ok(())
    }

    pub fn service(&self) -> crate::trace::ServiceId {
        let service = crate::trace::ServiceId::new(self.service_name.clone());
        match &self.service_namespace {
            Some(ns) => service.with_namespace(ns.clone()),
            None => service,
        }
    }
}
