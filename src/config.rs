use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Namespaces;
use crate::engine::EngineSettings;
use crate::routes::{CollectionRoute, RouteTable};

/// Environment variable holding the data API key.
pub const API_KEY_ENV: &str = "OFFLINE_RELAY_API_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Deployed version; names the current cache namespaces
  pub version: String,
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Origin serving the web app's static build
  pub upstream: Url,
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub collections: Vec<CollectionRoute>,
  #[serde(default)]
  pub replay: ReplayConfig,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin of the data API, e.g. `https://xyz.supabase.co`
  pub origin: Url,
  /// Local paths forwarded to the API origin
  #[serde(default = "default_path_prefixes")]
  pub path_prefixes: Vec<String>,
  /// Hosts treated as API traffic (suffix match). Defaults to the origin's host.
  #[serde(default)]
  pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_static_prefix")]
  pub static_prefix: String,
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Assets precached on install, relative to `upstream`
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Document served for navigations while offline
  #[serde(default = "default_offline_shell")]
  pub offline_shell: Option<String>,
  /// SQLite file (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_prefix: default_static_prefix(),
      api_prefix: default_api_prefix(),
      manifest: default_manifest(),
      offline_shell: default_offline_shell(),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayConfig {
  /// Seconds between periodic replay attempts; none when unset
  pub periodic_interval_secs: Option<u64>,
  /// Failed attempts before a queued write is dead-lettered
  pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Default filter directive; `RUST_LOG` takes precedence
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 3001))
}

fn default_request_timeout() -> u64 {
  30
}

fn default_path_prefixes() -> Vec<String> {
  vec!["/rest/v1".to_string(), "/rpc".to_string()]
}

fn default_static_prefix() -> String {
  "todo-app".to_string()
}

fn default_api_prefix() -> String {
  "todo-api".to_string()
}

fn default_manifest() -> Vec<String> {
  ["/", "/index.html", "/manifest.json"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_offline_shell() -> Option<String> {
  Some("/index.html".to_string())
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-relay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-relay/config.yaml
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
        "No configuration file found. Create one at ~/.config/offline-relay/config.yaml\n\
                 See offline-relay.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-relay.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-relay").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.api.origin.host_str().is_none() {
      return Err(eyre!("api.origin must have a host: {}", self.api.origin));
    }
    for route in &self.collections {
      if !route.path.starts_with('/') {
        return Err(eyre!(
          "collection {} path must start with '/': {}",
          route.name,
          route.path
        ));
      }
    }
    Ok(())
  }

  /// Get the data API key from the environment, if set.
  pub fn get_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn periodic_interval(&self) -> Option<Duration> {
    self
      .replay
      .periodic_interval_secs
      .filter(|secs| *secs > 0)
      .map(Duration::from_secs)
  }

  pub fn namespaces(&self) -> Namespaces {
    Namespaces::for_version(&self.cache.static_prefix, &self.cache.api_prefix, &self.version)
  }

  /// Hosts whose traffic gets API policies.
  pub fn api_hosts(&self) -> Vec<String> {
    if !self.api.hosts.is_empty() {
      return self.api.hosts.clone();
    }
    self.api.origin.host_str().map(String::from).into_iter().collect()
  }

  /// Manifest entries as absolute URLs against `upstream`.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self
      .cache
      .manifest
      .iter()
      .map(|entry| {
        self
          .upstream
          .join(entry)
          .map_err(|e| eyre!("Invalid manifest entry {}: {}", entry, e))
      })
      .collect()
  }

  pub fn offline_shell(&self) -> Result<Option<Url>> {
    self
      .cache
      .offline_shell
      .as_deref()
      .map(|shell| {
        self
          .upstream
          .join(shell)
          .map_err(|e| eyre!("Invalid offline shell {}: {}", shell, e))
      })
      .transpose()
  }

  pub fn engine_settings(&self) -> Result<EngineSettings> {
    let routes = self
      .collections
      .iter()
      .map(|route| CollectionRoute {
        path: route.path.trim_end_matches('/').to_string(),
        ..route.clone()
      })
      .collect();

    Ok(EngineSettings {
      namespaces: self.namespaces(),
      routes: RouteTable::new(routes),
      api_hosts: self.api_hosts(),
      offline_shell: self.offline_shell()?,
      max_replay_attempts: self.replay.max_attempts,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
version: v1.1.0
upstream: http://localhost:3000
api:
  origin: https://demo.supabase.co
collections:
  - name: todos
    path: /rest/v1/todos/
"#;

  #[test]
  fn test_minimal_config_fills_defaults() {
    let config = Config::from_yaml(MINIMAL).unwrap();

    assert_eq!(config.listen, SocketAddr::from(([127, 0, 0, 1], 3001)));
    assert_eq!(config.api.path_prefixes, vec!["/rest/v1", "/rpc"]);
    assert_eq!(config.api_hosts(), vec!["demo.supabase.co"]);
    assert_eq!(config.request_timeout(), Duration::from_secs(30));
    assert_eq!(config.periodic_interval(), None);
    assert_eq!(config.logging.level, "info");

    let namespaces = config.namespaces();
    assert_eq!(namespaces.static_assets, "todo-app-v1.1.0");
    assert_eq!(namespaces.api, "todo-api-v1.1.0");
  }

  #[test]
  fn test_engine_settings() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    let settings = config.engine_settings().unwrap();

    let route = &settings.routes.routes()[0];
    assert_eq!(route.path, "/rest/v1/todos");
    assert_eq!(route.id_field, "id");
    assert_eq!(route.local_id_prefix, "offline_");
    assert_eq!(
      settings.offline_shell.unwrap().as_str(),
      "http://localhost:3000/index.html"
    );
    assert_eq!(settings.max_replay_attempts, None);
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
version: "2"
listen: 0.0.0.0:8080
upstream: https://app.example.com/
api:
  origin: https://demo.supabase.co
  path_prefixes: [/rest/v1]
  hosts: [supabase.co]
cache:
  static_prefix: site
  api_prefix: data
  manifest: [/, app.js]
  offline_shell: null
collections:
  - name: notes
    path: /rest/v1/notes
    id_field: uuid
    local_id_prefix: tmp_
replay:
  periodic_interval_secs: 60
  max_attempts: 5
logging:
  level: debug
  directory: /var/log/offline-relay
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.api_hosts(), vec!["supabase.co"]);
    assert_eq!(config.periodic_interval(), Some(Duration::from_secs(60)));
    let manifest: Vec<String> = config.manifest_urls().unwrap().iter().map(|u| u.to_string()).collect();
    assert_eq!(manifest, vec!["https://app.example.com/", "https://app.example.com/app.js"]);
    assert_eq!(config.offline_shell().unwrap(), None);

    let settings = config.engine_settings().unwrap();
    assert_eq!(settings.namespaces.api, "data-2");
    assert_eq!(settings.routes.routes()[0].id_field, "uuid");
    assert_eq!(settings.max_replay_attempts, Some(5));
  }

  #[test]
  fn test_invalid_config_is_rejected() {
    assert!(Config::from_yaml("version: v1").is_err());

    let bad_route = MINIMAL.replace("path: /rest/v1/todos/", "path: rest/v1/todos");
    assert!(Config::from_yaml(&bad_route).is_err());

    let no_version = MINIMAL.replace("version: v1.1.0", "version: \"\"");
    assert!(Config::from_yaml(&no_version).is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/offline-relay.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
