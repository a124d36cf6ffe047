//! Service configuration.
//!
//! Settings layer three sources, later ones winning: built-in defaults, an
//! optional TOML file, and `TETHER_`-prefixed environment variables (nested
//! keys joined with `__`, e.g. `TETHER_AGENT__BINARY`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Agent subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path to (or name of) the agent CLI binary.
    pub binary: PathBuf,
    /// Permission mode passed to the agent (e.g. "default", "plan").
    #[serde(default)]
    pub permission_mode: Option<String>,
    /// Tools pre-approved without asking.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools the agent may never use.
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    /// Skip the permission system entirely.
    #[serde(default)]
    pub skip_permissions: bool,
    /// Exit codes treated as "continue where you left off" rather than
    /// failure. The agent's own wall-clock limit surfaces this way.
    #[serde(default)]
    pub benign_exit_codes: Vec<i32>,
    /// Attempt budget for the in-turn retry loop.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity window after which a session is eligible for cleanup.
    /// Aligned with the agent CLI's own session lifetime.
    #[serde(default = "default_session_timeout_secs")]
    pub timeout_secs: u64,
    /// All working directories must resolve under this root.
    pub workspace_root: PathBuf,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Attachment staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Root directory for per-request staging dirs.
    pub root: PathBuf,
    /// Per-attachment decoded size cap.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_bytes: u64,
}

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Sweep interval. Monitoring is disabled when `enabled` is false
    /// (test configuration).
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_warning")]
    pub memory_warning_bytes: u64,
    #[serde(default = "default_memory_critical")]
    pub memory_critical_bytes: u64,
    #[serde(default = "default_cpu_warning")]
    pub cpu_warning_percent: f32,
    #[serde(default = "default_cpu_critical")]
    pub cpu_critical_percent: f32,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub agent: AgentConfig,
    pub sessions: SessionConfig,
    pub attachments: AttachmentConfig,
    #[serde(default = "HealthConfig::default")]
    pub health: HealthConfig,
    /// Graceful shutdown drain window.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            enabled: true,
            memory_warning_bytes: default_memory_warning(),
            memory_critical_bytes: default_memory_critical(),
            cpu_warning_percent: default_cpu_warning(),
            cpu_critical_percent: default_cpu_critical(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("agent.binary", "claude")?
            .set_default("sessions.workspace_root", default_workspace_root())?
            .set_default("attachments.root", default_attachment_root())?;

        let path = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };
        if let Some(path) = path {
            let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            builder = builder.add_source(
                File::new(&expanded, FileFormat::Toml).required(config_path.is_some()),
            );
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix("TETHER").separator("__"))
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Settings for tests: everything scoped under `root`, health sweep off,
    /// short shutdown drain.
    pub fn test_defaults(root: &Path) -> Self {
        Self {
            agent: AgentConfig {
                binary: PathBuf::from("claude"),
                permission_mode: None,
                allowed_tools: Vec::new(),
                disallowed_tools: Vec::new(),
                skip_permissions: false,
                benign_exit_codes: Vec::new(),
                max_retries: default_max_retries(),
            },
            sessions: SessionConfig {
                timeout_secs: default_session_timeout_secs(),
                workspace_root: root.to_path_buf(),
            },
            attachments: AttachmentConfig {
                root: root.join("attachments"),
                max_bytes: default_max_attachment_bytes(),
            },
            health: HealthConfig {
                enabled: false,
                ..HealthConfig::default()
            },
            shutdown_timeout_secs: 1,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if !self.sessions.workspace_root.is_absolute() {
            anyhow::bail!(
                "sessions.workspace_root must be absolute, got {:?}",
                self.sessions.workspace_root
            );
        }
        if !self.attachments.root.is_absolute() {
            anyhow::bail!(
                "attachments.root must be absolute, got {:?}",
                self.attachments.root
            );
        }
        if self.agent.max_retries == 0 {
            anyhow::bail!("agent.max_retries must be at least 1");
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
}

fn default_workspace_root() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("projects")
        .to_string_lossy()
        .into_owned()
}

fn default_attachment_root() -> String {
    std::env::temp_dir()
        .join("tether-attachments")
        .to_string_lossy()
        .into_owned()
}

fn default_session_timeout_secs() -> u64 {
    86_400
}

fn default_max_attachment_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_memory_warning() -> u64 {
    500 * 1024 * 1024
}

fn default_memory_critical() -> u64 {
    1024 * 1024 * 1024
}

fn default_cpu_warning() -> f32 {
    80.0
}

fn default_cpu_critical() -> f32 {
    95.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_defaults_disable_health() {
        let settings = Settings::test_defaults(Path::new("/tmp/tether-test"));
        assert!(!settings.health.enabled);
        assert_eq!(settings.shutdown_timeout_secs, 1);
        assert_eq!(settings.agent.max_retries, 3);
    }

    #[test]
    fn test_default_thresholds() {
        let health = HealthConfig::default();
        assert_eq!(health.memory_warning_bytes, 500 * 1024 * 1024);
        assert_eq!(health.memory_critical_bytes, 1024 * 1024 * 1024);
        assert!((health.cpu_critical_percent - 95.0).abs() < f32::EPSILON);
    }
}
