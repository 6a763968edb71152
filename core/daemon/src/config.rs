//! Daemon configuration (`~/.logit/daemon/config.toml`).
//!
//! Every field has a default, so a missing file or a missing section is
//! equivalent to an empty one.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::sampler::RelevancePolicy;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".logit/daemon/config.toml";
const MIN_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelevanceConfig {
    #[serde(default = "default_require_visible_window")]
    pub require_visible_window: bool,
    #[serde(default = "default_self_names")]
    pub self_names: Vec<String>,
    #[serde(default = "default_system_dirs")]
    pub system_dirs: Vec<PathBuf>,
    #[serde(default = "default_window_probe_timeout_ms")]
    pub window_probe_timeout_ms: u64,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            require_visible_window: default_require_visible_window(),
            self_names: default_self_names(),
            system_dirs: default_system_dirs(),
            window_probe_timeout_ms: default_window_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl DaemonConfig {
    /// Tick interval, never shorter than `MIN_INTERVAL_MS`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.monitor.interval_ms.max(MIN_INTERVAL_MS))
    }

    pub fn window_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.relevance.window_probe_timeout_ms)
    }

    pub fn policy(&self) -> RelevancePolicy {
        RelevancePolicy {
            require_visible_window: self.relevance.require_visible_window,
            self_names: self.relevance.self_names.clone(),
            system_dirs: self.relevance.system_dirs.clone(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_require_visible_window() -> bool {
    true
}

fn default_self_names() -> Vec<String> {
    vec!["LogIt.UI".to_string()]
}

fn default_window_probe_timeout_ms() -> u64 {
    500
}

#[cfg(windows)]
fn default_system_dirs() -> Vec<PathBuf> {
    ["SystemRoot", "windir"]
        .iter()
        .filter_map(|name| std::env::var_os(name))
        .map(PathBuf::from)
        .collect()
}

#[cfg(not(windows))]
fn default_system_dirs() -> Vec<PathBuf> {
    Vec::new()
}

pub fn default_config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse daemon config {}: {}",
            config_path.display(),
            err
        )
    })
}
