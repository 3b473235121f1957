//! punchclock configuration system.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PunchError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchConfig {
    /// Where runtime state, the event log, settings and artifacts live.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_job_name")]
    pub job_name: String,
    /// Shared secret required by the HTTP run endpoint (empty = open).
    #[serde(default)]
    pub job_secret: String,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_data_dir() -> String { "~/.punchclock/data".into() }
fn default_job_name() -> String { "workday_flow".into() }

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            job_name: default_job_name(),
            job_secret: String::new(),
            target: TargetConfig::default(),
            schedule: ScheduleConfig::default(),
            webhooks: WebhookConfig::default(),
            driver: DriverConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl PunchConfig {
    /// Load config from the default path (~/.punchclock/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PunchError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PunchError::Config(format!("Failed to parse config: {e}")))?;
        config.schedule.first_window()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PunchError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the punchclock home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".punchclock")
    }

    /// Data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }

    /// Reusable browser session artifact for this job.
    pub fn session_artifact(&self) -> PathBuf {
        if self.target.session_artifact.is_empty() {
            self.data_dir()
                .join("storage")
                .join(format!("{}.json", self.job_name))
        } else {
            PathBuf::from(shellexpand::tilde(&self.target.session_artifact).to_string())
        }
    }

    /// Required keys that are still unset. Empty means the flow may run.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.target.url.trim().is_empty() {
            missing.push("target.url");
        }
        missing
    }
}

/// The web application being driven.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub url: String,
    /// Identifier pre-filled by the driver when a sign-in page shows up.
    #[serde(default)]
    pub sso_email: String,
    /// Path to the reusable session artifact (empty = `<data_dir>/storage/<job>.json`).
    #[serde(default)]
    pub session_artifact: String,
}

/// Time windows and loop cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Earliest local time for the first action, `HH:MM`.
    #[serde(default = "default_first_window_start")]
    pub first_window_start: String,
    /// End (exclusive) of the first-action window, `HH:MM`.
    #[serde(default = "default_first_window_end")]
    pub first_window_end: String,
    /// Upper bound of one sleep increment while waiting for a target.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_events_retention_days")]
    pub events_retention_days: u32,
    /// Start a run automatically when the first window opens.
    #[serde(default)]
    pub auto_start: bool,
    /// How long after the first window a `waiting_start` run may still resume.
    #[serde(default = "default_resume_grace_secs")]
    pub resume_grace_secs: u64,
}

fn default_first_window_start() -> String { "06:58".into() }
fn default_first_window_end() -> String { "08:31".into() }
fn default_tick_secs() -> u64 { 30 }
fn default_events_retention_days() -> u32 { 30 }
fn default_resume_grace_secs() -> u64 { 300 }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            first_window_start: default_first_window_start(),
            first_window_end: default_first_window_end(),
            tick_secs: default_tick_secs(),
            events_retention_days: default_events_retention_days(),
            auto_start: false,
            resume_grace_secs: default_resume_grace_secs(),
        }
    }
}

impl ScheduleConfig {
    /// Parsed first-action window as local wall-clock times.
    pub fn first_window(&self) -> Result<(NaiveTime, NaiveTime)> {
        let start = parse_clock(&self.first_window_start)?;
        let end = parse_clock(&self.first_window_end)?;
        if start >= end {
            return Err(PunchError::Config(format!(
                "first_window_start ({}) must be before first_window_end ({})",
                self.first_window_start, self.first_window_end
            )));
        }
        Ok((start, end))
    }
}

fn parse_clock(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| PunchError::Config(format!("Invalid time '{raw}' (expected HH:MM): {e}")))
}

/// Outbound notification endpoints. Empty URL = skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub start_break: String,
    #[serde(default)]
    pub stop_break: String,
    #[serde(default, rename = "final")]
    pub final_result: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 { 15 }

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            start: String::new(),
            start_break: String::new(),
            stop_break: String::new(),
            final_result: String::new(),
            timeout_secs: default_webhook_timeout(),
        }
    }
}

/// How physical actions are carried out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    /// External automation helper invoked as `<command> <verb> [args..]`.
    #[serde(default)]
    pub command: String,
    /// Log actions instead of performing them.
    #[serde(default)]
    pub dry_run: bool,
}

/// HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 8099 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_defaults() {
        let cfg = PunchConfig::default();
        assert_eq!(cfg.job_name, "workday_flow");
        assert_eq!(cfg.schedule.tick_secs, 30);
        let (start, end) = cfg.schedule.first_window().unwrap();
        assert_eq!((start.hour(), start.minute()), (6, 58));
        assert_eq!((end.hour(), end.minute()), (8, 31));
        assert_eq!(cfg.missing_required(), vec!["target.url"]);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: PunchConfig = toml::from_str(
            r#"
            data_dir = "/tmp/punch"

            [target]
            url = "https://example.invalid/clock"

            [webhooks]
            final = "https://hooks.example.invalid/final"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir(), PathBuf::from("/tmp/punch"));
        assert!(cfg.missing_required().is_empty());
        assert_eq!(cfg.webhooks.final_result, "https://hooks.example.invalid/final");
        assert_eq!(cfg.webhooks.timeout_secs, 15);
        assert_eq!(
            cfg.session_artifact(),
            PathBuf::from("/tmp/punch/storage/workday_flow.json")
        );
    }

    #[test]
    fn test_inverted_window_rejected() {
        let schedule = ScheduleConfig {
            first_window_start: "09:00".into(),
            first_window_end: "08:00".into(),
            ..ScheduleConfig::default()
        };
        assert!(schedule.first_window().is_err());

        let schedule = ScheduleConfig {
            first_window_start: "7h".into(),
            ..ScheduleConfig::default()
        };
        assert!(matches!(schedule.first_window(), Err(PunchError::Config(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("punchclock-test-config");
        let path = dir.join("config.toml");
        let mut cfg = PunchConfig::default();
        cfg.target.url = "https://example.invalid".into();
        cfg.save_to(&path).unwrap();

        let loaded = PunchConfig::load_from(&path).unwrap();
        assert_eq!(loaded.target.url, "https://example.invalid");
        std::fs::remove_dir_all(&dir).ok();
    }
}
