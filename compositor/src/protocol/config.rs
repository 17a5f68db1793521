use anyhow::{Context, Result};
use libwatch::BackoffPolicy;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Xline endpoints
    pub xline_config: XlineConfig,
    pub watch: WatchConfig,
    pub writer: WriterConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Namespace whose structureRef pointer is followed.
    pub namespace: String,
    // how long the store may hold one long-poll
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_error_delay_secs")]
    pub error_delay_secs: u64,
    #[serde(default = "default_watch_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_watch_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_target_id")]
    pub target_id: String,
    pub namespace: String,
    pub cloud_provider: Option<String>,
    pub cloud_oidc_proxy_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_reconcile_backoff_min_secs")]
    pub backoff_min_secs: u64,
    #[serde(default = "default_reconcile_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_true")]
    pub integration_enabled: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            backoff_min_secs: default_reconcile_backoff_min_secs(),
            backoff_max_secs: default_reconcile_backoff_max_secs(),
            integration_enabled: true,
        }
    }
}

fn default_wait_secs() -> u64 {
    9 * 60
}

fn default_error_delay_secs() -> u64 {
    5
}

fn default_watch_backoff_min_ms() -> u64 {
    500
}

fn default_watch_backoff_max_ms() -> u64 {
    60_000
}

fn default_target_id() -> String {
    "composite-structure".to_string()
}

fn default_interval_secs() -> u64 {
    30
}

fn default_reconcile_backoff_min_secs() -> u64 {
    5
}

fn default_reconcile_backoff_max_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl WatchConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_secs(self.error_delay_secs)
    }

    pub fn backoff(&self) -> Result<BackoffPolicy> {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_min_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .context("invalid watch backoff")
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn backoff(&self) -> Result<BackoffPolicy> {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_min_secs),
            Duration::from_secs(self.backoff_max_secs),
        )
        .context("invalid reconcile backoff")
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    cfg.watch.backoff()?;
    cfg.reconcile.backoff()?;
    if cfg.watch.error_delay_secs == 0 {
        anyhow::bail!("watch.error_delay_secs must be positive");
    }
    if cfg.reconcile.interval_secs == 0 {
        anyhow::bail!("reconcile.interval_secs must be positive");
    }
    Ok(cfg)
}
