//! TOML-based configuration for vetus.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration that stores collections under `/var/lib/vetus`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::history::HISTORY_BRANCH_PREFIX;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VetusConfig {
    /// Repository root and identity settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Git backend settings.
    #[serde(default)]
    pub git: GitConfig,

    /// Remote synchronization behaviour.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Where collections live and how commits are attributed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding `_bare` and one working copy per user.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Branch the first (bootstrap) save is pushed to.
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Domain used to build commit emails (`<user>@<domain>`).
    #[serde(default = "default_email_domain")]
    pub email_domain: String,
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/vetus")
}
fn default_branch() -> String {
    "master".into()
}
fn default_email_domain() -> String {
    "vetus".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            default_branch: default_branch(),
            email_domain: default_email_domain(),
        }
    }
}

impl StoreConfig {
    /// Commit email for `user`.
    pub fn email_for(&self, user: &str) -> String {
        format!("{}@{}", user, self.email_domain)
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Git backend invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Executable to run (default `git`).
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Remote name inside each user clone.
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Bound for clone, fetch, pull and push.
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,

    /// Bound for every other git command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_binary() -> String {
    "git".into()
}
fn default_remote() -> String {
    "origin".into()
}
fn default_network_timeout() -> u64 {
    120
}
fn default_command_timeout() -> u64 {
    60
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            remote: default_remote(),
            network_timeout_secs: default_network_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl GitConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Push/pull behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How many times a rejected push is retried after pulling.
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,
}

fn default_push_retries() -> u32 {
    1
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_retries: default_push_retries(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl VetusConfig {
    /// Load a [`VetusConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: VetusConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.root.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "store.root".into(),
                detail: "root directory must not be empty".into(),
            });
        }
        if self.store.default_branch.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "store.default_branch".into(),
                detail: "default branch must not be empty".into(),
            });
        }
        if self.store.default_branch.starts_with(HISTORY_BRANCH_PREFIX) {
            return Err(ConfigError::InvalidValue {
                field: "store.default_branch".into(),
                detail: format!("'{}' prefix is reserved for history", HISTORY_BRANCH_PREFIX),
            });
        }
        if self.git.binary.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git.binary".into(),
                detail: "git binary must not be empty".into(),
            });
        }
        if self.git.network_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "git.network_timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.git.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "git.command_timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
