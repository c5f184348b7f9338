use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::MICROS_PER_DAY;

/// Directory under the project root holding the store, config and locks.
pub const TALLY_DIR: &str = ".tally";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Attempts before a conflicting allocation surfaces as a hard failure.
    #[serde(default = "default_sequence_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_sequence_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_sequence_attempts(),
            retry_delay_ms: default_sequence_retry_delay_ms(),
        }
    }
}

impl SequenceConfig {
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Leaf collection names whose mutations are recorded.
    #[serde(default = "default_monitored")]
    pub monitored: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            monitored: default_monitored(),
        }
    }
}

impl AuditConfig {
    /// Retention window in microseconds.
    #[must_use]
    pub fn retention_us(&self) -> i64 {
        i64::from(self.retention_days).saturating_mul(MICROS_PER_DAY)
    }

    #[must_use]
    pub fn is_monitored(&self, collection: &str) -> bool {
        self.monitored.iter().any(|name| name == collection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Attempts per batch before it is logged and skipped for this run.
    #[serde(default = "default_batch_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_batch_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            interval_hours: default_interval_hours(),
        }
    }
}

impl RetentionConfig {
    /// Backoff before retry number `attempt` (1-based): base, 2x base, 4x base...
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }

    /// Time between scheduled sweeps. Never shorter than one hour.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        let hours = if self.interval_hours == 0 { 1 } else { self.interval_hours };
        Duration::from_secs(hours.saturating_mul(3600))
    }
}

/// Per-user settings: default output mode and acting identity.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub human_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub ledger: LedgerConfig,
    pub user: UserConfig,
    pub resolved_output: String,
}

const fn default_sequence_attempts() -> u32 {
    5
}

const fn default_sequence_retry_delay_ms() -> u64 {
    10
}

const fn default_retention_days() -> u32 {
    365
}

fn default_monitored() -> Vec<String> {
    [
        "jobs",
        "team_members",
        "vehicles",
        "machines",
        "costs",
        "advances",
        "events",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

const fn default_batch_size() -> u32 {
    500
}

const fn default_batch_attempts() -> u32 {
    3
}

const fn default_base_backoff_ms() -> u64 {
    100
}

const fn default_interval_hours() -> u64 {
    24
}

/// Path of the ledger database under a project root.
#[must_use]
pub fn store_path(project_root: &Path) -> PathBuf {
    project_root.join(TALLY_DIR).join("ledger.sqlite3")
}

/// Path of the advisory lock held by the retention sweep.
#[must_use]
pub fn sweep_lock_path(project_root: &Path) -> PathBuf {
    project_root.join(TALLY_DIR).join("sweep.lock")
}

pub fn load_ledger_config(project_root: &Path) -> Result<LedgerConfig> {
    let path = project_root.join(TALLY_DIR).join("config.toml");
    if !path.exists() {
        return Ok(LedgerConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<LedgerConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("tally/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn resolve_config(project_root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let ledger = load_ledger_config(project_root)?;
    let user = load_user_config()?;

    let env_format = env::var("FORMAT").ok();
    let resolved_output = resolve_output(cli_json, user.output.as_deref(), env_format.as_deref());

    Ok(EffectiveConfig {
        ledger,
        user,
        resolved_output,
    })
}

fn resolve_output(cli_json: bool, user_output: Option<&str>, env_format: Option<&str>) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "table" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = user_output.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    "pretty".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = LedgerConfig::default();
        assert_eq!(config.sequence.max_attempts, 5);
        assert_eq!(config.audit.retention_days, 365);
        assert_eq!(config.retention.batch_size, 500);
        assert_eq!(config.retention.max_attempts, 3);
        assert!(config.audit.is_monitored("costs"));
        assert!(!config.audit.is_monitored("invoices"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_ledger_config(dir.path()).expect("load");
        assert_eq!(config.retention.interval_hours, 24);
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(TALLY_DIR)).expect("mkdir");
        std::fs::write(
            dir.path().join(TALLY_DIR).join("config.toml"),
            "[audit]\nretention_days = 30\n\n[retention]\nbatch_size = 10\n",
        )
        .expect("write config");

        let config = load_ledger_config(dir.path()).expect("load");
        assert_eq!(config.audit.retention_days, 30);
        assert_eq!(config.audit.retention_us(), 30 * MICROS_PER_DAY);
        assert_eq!(config.retention.batch_size, 10);
        assert_eq!(config.retention.max_attempts, 3);
        assert_eq!(config.sequence.max_attempts, 5);
        assert_eq!(config.audit.monitored.len(), 7);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(TALLY_DIR)).expect("mkdir");
        std::fs::write(dir.path().join(TALLY_DIR).join("config.toml"), "[audit\n")
            .expect("write config");
        assert!(load_ledger_config(dir.path()).is_err());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let retention = RetentionConfig {
            base_backoff_ms: 10,
            ..RetentionConfig::default()
        };
        assert_eq!(retention.backoff(1), Duration::from_millis(10));
        assert_eq!(retention.backoff(2), Duration::from_millis(20));
        assert_eq!(retention.backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn zero_interval_falls_back_to_one_hour() {
        let retention = RetentionConfig {
            interval_hours: 0,
            ..RetentionConfig::default()
        };
        assert_eq!(retention.interval(), Duration::from_secs(3600));

        let retention = RetentionConfig {
            interval_hours: 6,
            ..RetentionConfig::default()
        };
        assert_eq!(retention.interval(), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn output_precedence() {
        assert_eq!(resolve_output(true, Some("text"), Some("pretty")), "json");
        assert_eq!(resolve_output(false, Some("text"), Some("human")), "pretty");
        assert_eq!(resolve_output(false, Some("table"), None), "text");
        assert_eq!(resolve_output(false, None, Some("bogus")), "pretty");
    }
}
