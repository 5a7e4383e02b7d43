use anyhow::{Context, Result};
use chrono_tz::Tz;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::domain::EstimateField;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub solcast: SolcastConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}
impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolcastConfig {
    /// One or more API keys, comma separated
    pub api_key: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_usage_url")]
    pub usage_url: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Retries after the first attempt for non-429 failures
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_fetch_retry_delay")]
    pub fetch_retry_delay_secs: f64,
    /// Total attempts while the API answers 429
    #[serde(default = "default_busy_attempts")]
    pub busy_attempts: u32,
    #[serde(default = "default_busy_backoff")]
    pub busy_backoff_secs: f64,
    #[serde(default = "default_busy_jitter")]
    pub busy_jitter_secs: f64,
}

impl SolcastConfig {
    /// Configured keys in order, blanks dropped
    pub fn api_keys(&self) -> Vec<String> {
        self.api_key
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect()
    }

    /// Delays must be usable as durations
    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("fetch_retry_delay_secs", self.fetch_retry_delay_secs),
            ("busy_backoff_secs", self.busy_backoff_secs),
            ("busy_jitter_secs", self.busy_jitter_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                anyhow::bail!("solcast.{name} must be a finite, non-negative number, got {secs}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub time_zone: Tz,
    /// Initial values for a fresh options document
    pub key_estimate: EstimateField,
    pub custom_hours: u32,
    /// kW, comma separated per API key; absent means unlimited
    pub hard_limit: Option<String>,
    pub default_damp_factor: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            time_zone: Tz::UTC,
            key_estimate: EstimateField::Estimate,
            custom_hours: 1,
            hard_limit: None,
            default_damp_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// 0 disables automatic updates
    pub auto_update_minutes: u64,
    pub stale_after_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_update_minutes: 60,
            stale_after_hours: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: String,
    /// One JSON object per line; plain text otherwise
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,hyper=warn,reqwest=warn,tower_http=info".into(),
            json: true,
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}
fn default_host() -> String {
    "https://api.solcast.com.au".into()
}
fn default_usage_url() -> String {
    "https://api.solcast.com.au/json/reply/GetUserUsageAllowance".into()
}
fn default_http_timeout() -> u64 {
    60
}
fn default_fetch_retries() -> u32 {
    3
}
fn default_fetch_retry_delay() -> f64 {
    5.0
}
fn default_busy_attempts() -> u32 {
    5
}
fn default_busy_backoff() -> f64 {
    30.0
}
fn default_busy_jitter() -> f64 {
    30.0
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("SOLCAST__").split("__"));
        let config: Self = figment.extract().context("invalid configuration")?;
        if config.solcast.api_keys().is_empty() {
            anyhow::bail!("solcast.api_key must hold at least one API key (set SOLCAST__SOLCAST__API_KEY)");
        }
        config.solcast.validate()?;
        Ok(config)
    }
}
