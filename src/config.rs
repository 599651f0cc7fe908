use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "FORUM_VIEW";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub page: PageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000/".to_string()
}

fn default_user_agent() -> String {
    format!("forum-view/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

/// Polling cadence for the recurring sync units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default = "default_shoutbox_interval", with = "humantime_serde")]
    pub shoutbox_interval: Duration,
    #[serde(default = "default_counts_interval", with = "humantime_serde")]
    pub counts_interval: Duration,
    /// How long an unconfirmed shout stays on screen before it is dropped.
    #[serde(default = "default_pending_ttl", with = "humantime_serde")]
    pub pending_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            shoutbox_interval: default_shoutbox_interval(),
            counts_interval: default_counts_interval(),
            pending_ttl: default_pending_ttl(),
        }
    }
}

fn default_shoutbox_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_counts_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_pending_ttl() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PageConfig {
    #[serde(default)]
    pub current_user: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        } else {
            tracing::warn!("config file {} not found, using defaults", path.display());
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    let mut overrides = cfg.clone();
    apply_env(&mut overrides, prefix);
    cfg = merge_config(cfg, overrides);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.server.base_url.trim().is_empty() {
        base.server.base_url = other.server.base_url;
    }
    if !other.server.user_agent.trim().is_empty() {
        base.server.user_agent = other.server.user_agent;
    }
    if !other.server.timeout.is_zero() {
        base.server.timeout = other.server.timeout;
    }

    if !other.sync.shoutbox_interval.is_zero() {
        base.sync.shoutbox_interval = other.sync.shoutbox_interval;
    }
    if !other.sync.counts_interval.is_zero() {
        base.sync.counts_interval = other.sync.counts_interval;
    }
    base.sync.pending_ttl = other.sync.pending_ttl;

    if let Some(user) = other.page.current_user {
        if !user.trim().is_empty() {
            base.page.current_user = Some(user);
        }
    }

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "server.base_url" => cfg.server.base_url = value,
        "server.user_agent" => cfg.server.user_agent = value,
        "server.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.server.timeout = duration;
            }
        }
        "sync.shoutbox_interval" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.sync.shoutbox_interval = duration;
            }
        }
        "sync.counts_interval" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.sync.counts_interval = duration;
            }
        }
        "sync.pending_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.sync.pending_ttl = duration;
            }
        }
        "page.current_user" => cfg.page.current_user = Some(value),
        _ => tracing::debug!("ignoring unknown config override {key}"),
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("forum-view").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some("FORUM_VIEW_TEST_DEFAULTS".into()),
        })
        .unwrap();
        assert_eq!(cfg.sync.shoutbox_interval, Duration::from_secs(5));
        assert_eq!(cfg.sync.counts_interval, Duration::from_secs(60));
        assert_eq!(cfg.server.base_url, default_base_url());
        assert_eq!(cfg.page.current_user, None);
    }

    #[test]
    fn reads_yaml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "server:\n  base_url: http://forum.test/\nsync:\n  shoutbox_interval: 2s\npage:\n  current_user: alice\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("FORUM_VIEW_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.server.base_url, "http://forum.test/");
        assert_eq!(cfg.sync.shoutbox_interval, Duration::from_secs(2));
        assert_eq!(cfg.sync.counts_interval, Duration::from_secs(60));
        assert_eq!(cfg.page.current_user.as_deref(), Some("alice"));
    }

    #[test]
    fn env_overrides() {
        env::set_var("FORUM_VIEW_TEST_ENV_SYNC__COUNTS_INTERVAL", "90s");
        env::set_var("FORUM_VIEW_TEST_ENV_PAGE__CURRENT_USER", "bob");
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some("FORUM_VIEW_TEST_ENV".into()),
        })
        .unwrap();
        assert_eq!(cfg.sync.counts_interval, Duration::from_secs(90));
        assert_eq!(cfg.page.current_user.as_deref(), Some("bob"));
        env::remove_var("FORUM_VIEW_TEST_ENV_SYNC__COUNTS_INTERVAL");
        env::remove_var("FORUM_VIEW_TEST_ENV_PAGE__CURRENT_USER");
    }
}
