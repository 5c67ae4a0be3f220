use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use serde::Deserialize;

use crate::cache::{DEFAULT_STALE_AFTER_DAYS, DEFAULT_TTL_SECS};
use crate::governor::DEFAULT_MAX_DAILY_REQUESTS;
use crate::sync::{OwnerSwitchPolicy, RetryPolicy, SyncConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// Owner to act as when the backend has no session (e.g. offline use)
  pub owner_id: Option<String>,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Backend base URL, e.g. https://project.example.co
  pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file for the durable store (default: $XDG_DATA_HOME/shopsync/store.db)
  pub path: Option<PathBuf>,
}

/// Sync tuning knobs as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  pub max_daily_requests: u32,
  pub offline_mode: bool,
  pub cache_ttl_secs: u64,
  pub min_interval_secs: u64,
  pub debounce_secs: u64,
  pub fetch_pause_secs: u64,
  pub request_timeout_secs: u64,
  pub max_attempts: u32,
  pub retry_backoff_ms: u64,
  pub stale_after_days: u64,
  pub fetch_limit: usize,
  pub owner_switch: OwnerSwitchPolicy,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      max_daily_requests: DEFAULT_MAX_DAILY_REQUESTS,
      offline_mode: false,
      cache_ttl_secs: DEFAULT_TTL_SECS as u64,
      min_interval_secs: 300,
      debounce_secs: 30,
      fetch_pause_secs: 3,
      request_timeout_secs: 30,
      max_attempts: 1,
      retry_backoff_ms: 0,
      stale_after_days: DEFAULT_STALE_AFTER_DAYS as u64,
      fetch_limit: 1000,
      owner_switch: OwnerSwitchPolicy::default(),
    }
  }
}

impl From<&SyncSettings> for SyncConfig {
  fn from(s: &SyncSettings) -> Self {
    SyncConfig {
      max_daily_requests: s.max_daily_requests,
      offline_mode: s.offline_mode,
      cache_ttl: Duration::from_secs(s.cache_ttl_secs),
      min_interval: Duration::from_secs(s.min_interval_secs),
      debounce: Duration::from_secs(s.debounce_secs),
      fetch_pause: Duration::from_secs(s.fetch_pause_secs),
      retry: RetryPolicy {
        max_attempts: s.max_attempts.max(1),
        backoff: Duration::from_millis(s.retry_backoff_ms),
        timeout: Duration::from_secs(s.request_timeout_secs),
      },
      stale_after: Duration::from_secs(s.stale_after_days * 24 * 60 * 60),
      fetch_limit: s.fetch_limit.max(1),
      owner_switch: s.owner_switch,
    }
  }
}

/// Environment variable naming a config file, checked before the usual places
pub const CONFIG_ENV: &str = "SHOPSYNC_CONFIG";

impl Config {
  /// Load the configuration from `explicit_path`, or else from the first
  /// existing file among [`Config::search_paths`].
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if !p.is_file() => return Err(eyre!("Config file not found: {}", p.display())),
      Some(p) => p.to_path_buf(),
      None => {
        let candidates = Self::search_paths();
        candidates
          .iter()
          .find(|p| p.is_file())
          .cloned()
          .ok_or_else(|| {
            let looked_in: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
            eyre!("No configuration file found (looked in: {})", looked_in.join(", "))
          })?
      }
    };

    let contents = std::fs::read_to_string(&path)
      .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
    Self::parse(&contents).wrap_err_with(|| format!("Invalid config file {}", path.display()))
  }

  /// Places a config file is looked for, most specific first:
  /// `$SHOPSYNC_CONFIG`, `./shopsync.yaml`, `$XDG_CONFIG_HOME/shopsync/config.yaml`.
  pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(3);
    if let Some(from_env) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
      paths.push(PathBuf::from(from_env));
    }
    paths.push(PathBuf::from("shopsync.yaml"));
    if let Some(config_dir) = dirs::config_dir() {
      paths.push(config_dir.join("shopsync").join("config.yaml"));
    }
    paths
  }

  fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Sync settings in runtime form
  pub fn sync_config(&self) -> SyncConfig {
    SyncConfig::from(&self.sync)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks SHOPSYNC_API_KEY.
  pub fn get_api_key() -> Result<String> {
    std::env::var("SHOPSYNC_API_KEY")
      .map_err(|_| eyre!("Backend API key not found. Set the SHOPSYNC_API_KEY environment variable."))
  }

  /// Get the signed-in user's access token, if any.
  ///
  /// Checks SHOPSYNC_ACCESS_TOKEN.
  pub fn get_access_token() -> Option<String> {
    std::env::var("SHOPSYNC_ACCESS_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
