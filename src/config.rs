use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::SqliteStorage;
use crate::routes::{Route, RouteTable, Strategy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Name of the current cache bucket. Changing it invalidates every
  /// previously cached asset.
  pub cache_version: String,
  /// Base URL that relative asset and request URLs resolve against
  pub origin: Url,
  /// Assets pre-cached on install, in order
  #[serde(default = "default_assets")]
  pub assets: Vec<String>,
  /// Routing rules, first match wins
  #[serde(default = "default_routes")]
  pub routes: Vec<Route>,
  /// Strategy for requests no rule matches
  #[serde(default = "default_fallback")]
  pub fallback: Strategy,
  /// Cache database location (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

fn default_assets() -> Vec<String> {
  [
    "/",
    "/static/manifest.webmanifest",
    "https://cdn.jsdelivr.net/npm/choices.js/public/assets/styles/choices.min.css",
    "https://cdn.jsdelivr.net/npm/choices.js/public/assets/scripts/choices.min.js",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_routes() -> Vec<Route> {
  RouteTable::default().routes().to_vec()
}

fn default_fallback() -> Strategy {
  Strategy::CacheFirst
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./conv-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/conv-cache/config.yaml
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
        "No configuration file found. Create one at ~/.config/conv-cache/config.yaml\n\
                 See conv-cache.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("conv-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("conv-cache").join("config.yaml");
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

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache_version.trim().is_empty() {
      return Err(eyre!("cache_version must not be empty"));
    }
    if self.origin.cannot_be_a_base() {
      return Err(eyre!("origin {} cannot be used as a base URL", self.origin));
    }
    self.asset_urls()?;
    Ok(())
  }

  /// Resolve a possibly relative URL against the origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  pub fn asset_urls(&self) -> Result<Vec<Url>> {
    self.assets.iter().map(|a| self.resolve(a)).collect()
  }

  pub fn route_table(&self) -> RouteTable {
    RouteTable::new(self.routes.clone(), self.fallback)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }
}
