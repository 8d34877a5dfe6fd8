//! Master configuration.
//!
//! Configuration is loaded from a TOML file merged with environment
//! variables (prefixed with `STAIN_MASTER_`), then validated. Durations are
//! given in milliseconds.
//!
//! # Example
//! ```no_run
//! use stain_master::config::MasterConfig;
//!
//! let config = MasterConfig::load()?;
//! println!("instrument: {}", config.application.name);
//! # Ok::<(), stain_master::error::MasterError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the Master process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Dispatch-channel settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Protocol-layer settings shared by all links.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Managed external processes.
    #[serde(default)]
    pub processes: Vec<ProcessDefinition>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Instrument/application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Dispatch-channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Mailbox capacity per channel direction.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

/// Protocol-layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Per-command acknowledge timeout in milliseconds.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Heartbeat probe interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Directory of per-message schema files; `None` disables validation.
    #[serde(default)]
    pub schema_dir: Option<PathBuf>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            schema_dir: None,
        }
    }
}

impl ProtocolConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// One managed external process and the policy applied to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique process name, e.g. `gui`, `remote-care`.
    pub name: String,
    /// Command line used to start (and restart) the process.
    pub start_command: String,
    /// TCP address this process's peer connection is accepted on.
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Whether the peer may log in remotely.
    #[serde(default = "default_true")]
    pub remote_login_allowed: bool,
    /// How long to wait for the peer to (re)connect before giving up.
    #[serde(default = "default_login_timeout")]
    pub remote_login_timeout_ms: u64,
    /// Disconnect-guard window length.
    #[serde(default = "default_disconnect_window")]
    pub disconnect_window_ms: u64,
    /// Disconnects tolerated inside one guard window before the process is
    /// declared unrecoverable.
    #[serde(default = "default_max_disconnects")]
    pub max_disconnects: u32,
}

impl ProcessDefinition {
    pub fn remote_login_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_login_timeout_ms)
    }

    pub fn disconnect_window(&self) -> Duration {
        Duration::from_millis(self.disconnect_window_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mailbox_capacity() -> usize {
    32
}

fn default_ack_timeout() -> u64 {
    3000
}

fn default_heartbeat_interval() -> u64 {
    2000
}

fn default_login_timeout() -> u64 {
    30_000
}

fn default_disconnect_window() -> u64 {
    60_000
}

fn default_max_disconnects() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl MasterConfig {
    /// Load configuration from `config/master.toml` and environment variables.
    ///
    /// Environment variables can override configuration with prefix
    /// `STAIN_MASTER_`, e.g. `STAIN_MASTER_APPLICATION_LOG_LEVEL=debug`.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/master.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STAIN_MASTER_").split("_"))
            .extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.protocol.ack_timeout_ms == 0 {
            return Err("ack_timeout_ms must be greater than zero".to_string());
        }
        if self.protocol.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than zero".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for process in &self.processes {
            if process.start_command.trim().is_empty() {
                return Err(format!("Process '{}' has an empty start_command", process.name));
            }
            if process.disconnect_window_ms == 0 {
                return Err(format!(
                    "Process '{}' has a zero-length disconnect window",
                    process.name
                ));
            }
            if !names.insert(&process.name) {
                return Err(format!("Duplicate process name: {}", process.name));
            }
        }

        Ok(())
    }
}
