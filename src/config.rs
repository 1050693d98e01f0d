use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::db::Database;
use crate::worker::{AssetManifest, DEFAULT_ASSETS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the application being cached
  pub upstream: String,
  /// Address the proxy listens on
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Assets to precache on install, as paths or absolute URLs
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Let a new version take control as soon as it is installed
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  /// How often to re-read this file for a new version (0 disables)
  #[serde(default = "default_update_interval")]
  pub update_interval_secs: u64,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  /// Largest request body the proxy will buffer
  #[serde(default = "default_max_body_bytes")]
  pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Versioned cache store name; changing it invalidates every cached asset
  #[serde(default = "default_cache_name")]
  pub name: String,
  /// SQLite database holding the stores (defaults to the data directory)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: default_cache_name(),
      database: None,
    }
  }
}

/// Values given on the command line that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
  pub upstream: Option<String>,
  pub database: Option<PathBuf>,
  pub listen: Option<SocketAddr>,
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_cache_name() -> String {
  "image-resizer-cache-v1".to_string()
}

fn default_manifest() -> Vec<String> {
  DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
  true
}

fn default_update_interval() -> u64 {
  300
}

fn default_request_timeout() -> u64 {
  30
}

fn default_max_body_bytes() -> usize {
  10 * 1024 * 1024
}

impl Config {
  /// Find the configuration file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./precache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/precache/config.yaml
  pub fn locate(explicit_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit_path {
      if p.exists() {
        return Ok(p.to_path_buf());
      }
      return Err(eyre!("Config file not found: {}", p.display()));
    }

    Self::find_config_file().ok_or_else(|| {
      eyre!(
        "No configuration file found. Create ./precache.yaml or ~/.config/precache/config.yaml\n\
                 with at least an `upstream:` URL."
      )
    })
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("precache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("precache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path, overrides: &Overrides) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents, overrides)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse YAML, apply overrides and validate.
  pub fn parse(contents: &str, overrides: &Overrides) -> Result<Self> {
    let mut config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    config.apply(overrides);
    config.validate()?;
    Ok(config)
  }

  fn apply(&mut self, overrides: &Overrides) {
    if let Some(upstream) = &overrides.upstream {
      self.upstream = upstream.clone();
    }
    if let Some(database) = &overrides.database {
      self.cache.database = Some(database.clone());
    }
    if let Some(listen) = overrides.listen {
      self.listen = listen;
    }
  }

  fn validate(&self) -> Result<()> {
    if self.cache.name.trim().is_empty() {
      return Err(eyre!("cache.name must not be empty"));
    }
    if self.request_timeout_secs == 0 {
      return Err(eyre!("request_timeout_secs must be positive"));
    }
    // Surfaces bad URLs and manifest entries at load time
    self.asset_manifest()?;
    Ok(())
  }

  /// The upstream base URL, always ending in `/` so paths resolve beneath it.
  pub fn origin(&self) -> Result<Url> {
    let mut url = Url::parse(&self.upstream)
      .map_err(|e| eyre!("Invalid upstream URL '{}': {}", self.upstream, e))?;

    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!(
        "Upstream must be an http(s) URL, got '{}'",
        self.upstream
      ));
    }

    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
      let path = format!("{}/", url.path());
      url.set_path(&path);
    }
    Ok(url)
  }

  pub fn asset_manifest(&self) -> Result<AssetManifest> {
    AssetManifest::resolve(&self.origin()?, &self.manifest)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(path) => Ok(path.clone()),
      None => Database::default_path(),
    }
  }

  pub fn update_interval(&self) -> Option<Duration> {
    (self.update_interval_secs > 0).then(|| Duration::from_secs(self.update_interval_secs))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}
