//! Typed configuration for the registry server (spec §6.3): loaded from a
//! TOML file with an environment-variable overlay, no untyped dynamic
//! `Config` object and no ad-hoc env-var scattered through the codebase.
//!
//! # Example
//!
//! ```
//! use protoreg_config::{load_config, Config};
//! use std::path::Path;
//!
//! let config = load_config(Path::new("does-not-exist.toml")).expect("load");
//! assert_eq!(config, Config::default());
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protoreg_retry::RetryConfig;
use serde::{Deserialize, Serialize};

/// Default config file name, analogous to a project-root dotfile.
pub const CONFIG_FILE: &str = "protoreg.toml";

/// Per-IP sliding-window rate limit (§6.3 `rateLimit`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max: u32,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u32 {
    120
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max: default_max_requests(),
        }
    }
}

/// One recognized DSSE verification key (§6.3 `provenanceKeys`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceKey {
    pub pubkey: String,
    pub alg: String,
    pub keyid: String,
}

/// The full recognized configuration surface from spec §6.3.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Required; the server refuses to start without it.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default = "default_json_limit")]
    pub json_limit: usize,
    #[serde(default)]
    pub require_provenance: bool,
    #[serde(default)]
    pub provenance_keys: Vec<ProvenanceKey>,
    #[serde(default)]
    pub retry_config: RetryConfig,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./registry.db")
}

fn default_json_limit() -> usize {
    1024 * 1024
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforces the one hard startup requirement from §6.3/§6.4: a
    /// non-empty API key. Everything else has a usable default.
    pub fn validate(&self) -> Result<()> {
        match &self.api_key {
            Some(key) if !key.is_empty() => Ok(()),
            _ => anyhow::bail!("apiKey is required; the server refuses to start without one"),
        }
    }

    /// Overlay `PROTOREG_*` environment variables on top of file-loaded
    /// values. Env wins over file, matching the usual config precedence
    /// (file provides defaults, environment overrides for deployment).
    pub fn apply_env_overlay(&mut self) {
        if let Ok(key) = std::env::var("PROTOREG_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(dir) = std::env::var("PROTOREG_BASE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("PROTOREG_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(max) = std::env::var("PROTOREG_RATE_LIMIT_MAX") {
            if let Ok(max) = max.parse() {
                self.rate_limit.max = max;
            }
        }
        if let Ok(window) = std::env::var("PROTOREG_RATE_LIMIT_WINDOW_MS") {
            if let Ok(window) = window.parse() {
                self.rate_limit.window_ms = window;
            }
        }
        if let Ok(require) = std::env::var("PROTOREG_REQUIRE_PROVENANCE") {
            self.require_provenance = matches!(require.as_str(), "1" | "true" | "yes");
        }
    }
}

/// Config file path under a directory.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Load from a specific TOML file, apply the environment overlay, and
/// return workspace defaults if the file doesn't exist (env vars still
/// apply in that case).
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };
    config.apply_env_overlay();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_api_key_and_fails_validation() {
        let config = Config::new();
        assert!(config.api_key.is_none());
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let td = tempdir().expect("tempdir");
        let config = load_config(&td.path().join("missing.toml")).expect("load");
        assert_eq!(config.base_dir, PathBuf::from("./data"));
        assert_eq!(config.rate_limit.max, 120);
    }

    #[test]
    fn load_config_from_toml_overrides_defaults() {
        let td = tempdir().expect("tempdir");
        let path = config_path(td.path());
        std::fs::write(
            &path,
            r#"
api_key = "secret"
base_dir = "/var/lib/registry"
db_path = "/var/lib/registry/registry.db"
require_provenance = true

[rate_limit]
window_ms = 30000
max = 60

[retry_config]
max_attempts = 7
base_delay = "5ms"
max_delay = "500ms"
jitter_factor = 0.25
"#,
        )
        .expect("write");

        let config = load_config(&path).expect("load");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.base_dir, PathBuf::from("/var/lib/registry"));
        assert!(config.require_provenance);
        assert_eq!(config.rate_limit.max, 60);
        assert_eq!(config.retry_config.max_attempts, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[allow(unsafe_code)]
    fn env_overlay_takes_precedence_over_file() {
        let td = tempdir().expect("tempdir");
        let path = config_path(td.path());
        std::fs::write(&path, "api_key = \"file-key\"\n").expect("write");

        unsafe {
            std::env::set_var("PROTOREG_API_KEY", "env-key");
        }
        let config = load_config(&path).expect("load");
        unsafe {
            std::env::remove_var("PROTOREG_API_KEY");
        }

        assert_eq!(config.api_key.as_deref(), Some("env-key"));
    }
}
