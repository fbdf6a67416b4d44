use figment::{
    providers::{Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Default session gateway address on the local host.
pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:18789";

/// Top-level runner configuration — a single JSON document.
///
/// Every field has a default, so an empty document (or a missing file) is a
/// valid configuration. Unknown keys are rejected rather than silently
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_run_retention_days")]
    pub run_retention_days: i64,
    #[serde(default = "default_state_cleanup_interval_ms")]
    pub state_cleanup_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            max_concurrency: default_max_concurrency(),
            run_retention_days: default_run_retention_days(),
            state_cleanup_interval_ms: default_state_cleanup_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            notifications: NotificationsConfig::default(),
            log: LogConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NotificationsConfig {
    /// Path to a file holding the Slack bot token. Missing means
    /// notifications are logged-and-dropped.
    pub slack_token_path: Option<String>,
    /// Fallback failure channel for jobs that do not set one.
    pub default_on_failure: Option<String>,
    /// Fallback success channel for jobs that do not set one.
    pub default_on_success: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "stdout" or a file path (opened in append mode).
    #[serde(default = "default_log_file")]
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    pub token_path: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token_path: None,
        }
    }
}

fn default_port() -> u16 {
    1937
}
fn default_db_path() -> String {
    "./data/runner.sqlite".to_string()
}
fn default_max_concurrency() -> usize {
    4
}
fn default_run_retention_days() -> i64 {
    30
}
fn default_state_cleanup_interval_ms() -> u64 {
    3_600_000
}
fn default_shutdown_grace_ms() -> u64 {
    30_000
}
fn default_reconcile_interval_ms() -> u64 {
    60_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    "stdout".to_string()
}
fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// Path resolution: explicit argument > `JOBRUN_CONFIG` env var >
    /// `./jobrun.json`. A missing file yields the defaults; a present but
    /// malformed document (bad JSON, unknown keys, wrong types) is a
    /// `Config` error.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("JOBRUN_CONFIG").ok())
            .unwrap_or_else(|| "./jobrun.json".to_string());

        Figment::new()
            .merge(Json::file(&path))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Parse configuration from a JSON string (used by tests and embedders).
    pub fn from_json(doc: &str) -> Result<Self> {
        Figment::new()
            .merge(Json::string(doc))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }
}
