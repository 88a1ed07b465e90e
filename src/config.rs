use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::ReconcileConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub accounts: Vec<AccountConfig>,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the Zalo backend (e.g., "https://backend.example.com")
  pub url: String,
  /// Per-request timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

/// A Zalo account whose rosters are cached locally.
///
/// The session cookie is a secret and is read from the environment, never
/// from this file.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
  /// Zalo user id of the account owner
  pub id: String,
  /// Optional label shown in listings
  pub name: Option<String>,
  pub imei: String,
  pub user_agent: String,
}

/// Reconciliation tuning. Defaults match the values observed to keep the
/// backend happy; none of them is load-bearing.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
  #[serde(default = "default_batch_delay_ms")]
  pub batch_delay_ms: u64,
  #[serde(default = "default_spurious_empty_threshold")]
  pub spurious_empty_threshold: usize,
  /// Distrust listings smaller than this fraction of the cache (0..=1)
  pub min_trusted_fraction: Option<f64>,
}

fn default_batch_size() -> usize {
  5
}

fn default_batch_delay_ms() -> u64 {
  1500
}

fn default_spurious_empty_threshold() -> usize {
  5
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      batch_size: default_batch_size(),
      batch_delay_ms: default_batch_delay_ms(),
      spurious_empty_threshold: default_spurious_empty_threshold(),
      min_trusted_fraction: None,
    }
  }
}

impl SyncConfig {
  pub fn reconcile_config(&self) -> ReconcileConfig {
    ReconcileConfig {
      batch_size: self.batch_size,
      batch_delay: Duration::from_millis(self.batch_delay_ms),
      spurious_empty_threshold: self.spurious_empty_threshold,
      min_trusted_fraction: self.min_trusted_fraction,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./zroster.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/zroster/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/zroster/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("zroster.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("zroster").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate configuration from YAML text.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.backend.url)
      .map_err(|e| eyre!("backend.url '{}' is not a valid URL: {}", self.backend.url, e))?;

    if self.sync.batch_size == 0 {
      return Err(eyre!("sync.batch_size must be at least 1"));
    }

    if let Some(fraction) = self.sync.min_trusted_fraction {
      if !(0.0..=1.0).contains(&fraction) {
        return Err(eyre!(
          "sync.min_trusted_fraction must be between 0 and 1, got {}",
          fraction
        ));
      }
    }

    Ok(())
  }

  /// Look up a configured account by id.
  pub fn account(&self, id: &str) -> Result<&AccountConfig> {
    self.accounts.iter().find(|a| a.id == id).ok_or_else(|| {
      let known: Vec<&str> = self.accounts.iter().map(|a| a.id.as_str()).collect();
      if known.is_empty() {
        eyre!("Unknown account {}. No accounts are configured.", id)
      } else {
        eyre!("Unknown account {}. Configured: {}", id, known.join(", "))
      }
    })
  }

  /// Get an account's session cookie from environment variables.
  ///
  /// Checks ZROSTER_COOKIE_<ACCOUNT_ID> first, then ZROSTER_COOKIE as fallback.
  pub fn get_session_cookie(account_id: &str) -> Result<String> {
    let specific = format!("ZROSTER_COOKIE_{}", account_id.to_uppercase());
    std::env::var(&specific)
      .or_else(|_| std::env::var("ZROSTER_COOKIE"))
      .map_err(|_| {
        eyre!(
          "Session cookie not found. Set {} or ZROSTER_COOKIE environment variable.",
          specific
        )
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const FULL: &str = r#"
backend:
  url: https://backend.example.com
  timeout_secs: 10
accounts:
  - id: "84901234567"
    name: Shop A
    imei: imei-1
    user_agent: Mozilla/5.0
sync:
  batch_size: 3
  batch_delay_ms: 500
  spurious_empty_threshold: 8
  min_trusted_fraction: 0.5
"#;

  #[test]
  fn test_parse_full_config() {
    let config = Config::from_yaml(FULL).unwrap();

    assert_eq!(config.backend.timeout_secs, 10);
    assert_eq!(config.accounts.len(), 1);
    assert_eq!(config.accounts[0].name.as_deref(), Some("Shop A"));

    let reconcile = config.sync.reconcile_config();
    assert_eq!(reconcile.batch_size, 3);
    assert_eq!(reconcile.batch_delay, Duration::from_millis(500));
    assert_eq!(reconcile.spurious_empty_threshold, 8);
    assert_eq!(reconcile.min_trusted_fraction, Some(0.5));
  }

  #[test]
  fn test_sync_defaults() {
    let config = Config::from_yaml("backend:\n  url: http://localhost:3000\n").unwrap();

    assert_eq!(config.backend.timeout_secs, 30);
    assert!(config.accounts.is_empty());
    assert_eq!(config.sync.reconcile_config(), ReconcileConfig::default());
  }

  #[test]
  fn test_rejects_zero_batch_size() {
    let yaml = "backend:\n  url: http://localhost\nsync:\n  batch_size: 0\n";
    assert!(Config::from_yaml(yaml).is_err());
  }

  #[test]
  fn test_rejects_out_of_range_fraction() {
    let yaml = "backend:\n  url: http://localhost\nsync:\n  min_trusted_fraction: 1.5\n";
    assert!(Config::from_yaml(yaml).is_err());
  }

  #[test]
  fn test_rejects_bad_url() {
    assert!(Config::from_yaml("backend:\n  url: not a url\n").is_err());
  }

  #[test]
  fn test_account_lookup() {
    let config = Config::from_yaml(FULL).unwrap();

    assert_eq!(config.account("84901234567").unwrap().imei, "imei-1");
    let err = config.account("123").unwrap_err().to_string();
    assert!(err.contains("84901234567"));
  }
}
