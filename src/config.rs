//! Capture configuration
//!
//! Settings are layered, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. A TOML file ([`CaptureConfig::from_toml_file`])
//! 3. A `.env` file (only fills variables the environment does not set)
//! 4. `SNAP_CAPTURE_*` environment variables
//!
//! One process-wide instance is built lazily on first access and can be
//! swapped with [`set_global_config`] or scoped with [`ConfigOverride`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use crate::filter::compile_patterns;
use crate::replay::ReplayMode;
use crate::storage::Backend;

pub const ENV_ENABLED: &str = "SNAP_CAPTURE_ENABLED";
pub const ENV_DEFAULT_PATH: &str = "SNAP_CAPTURE_DEFAULT_PATH";
pub const ENV_DEFAULT_RETENTION: &str = "SNAP_CAPTURE_DEFAULT_RETENTION";
pub const ENV_DEFAULT_OVERWRITE: &str = "SNAP_CAPTURE_DEFAULT_OVERWRITE";
pub const ENV_IGNORE_MODULES: &str = "SNAP_CAPTURE_IGNORE_MODULES";
pub const ENV_IGNORE_FUNCTIONS: &str = "SNAP_CAPTURE_IGNORE_FUNCTIONS";
pub const ENV_IGNORE_ARGS: &str = "SNAP_CAPTURE_IGNORE_ARGS";
pub const ENV_PRODUCTION_MODE: &str = "SNAP_CAPTURE_PRODUCTION_MODE";
pub const ENV_MINIMAL: &str = "SNAP_CAPTURE_MINIMAL";
pub const ENV_BACKEND: &str = "SNAP_CAPTURE_BACKEND";
pub const ENV_REPLAY_MODE: &str = "SNAP_CAPTURE_REPLAY_MODE";
/// Legacy switch: `1` forces recording of unmatched side effects
pub const ENV_SIDE_EFFECT_CAPTURE: &str = "SIDE_EFFECT_CAPTURE";

/// Capture settings shared by every wrapped function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    pub default_path: PathBuf,
    pub default_retention: usize,
    pub default_overwrite: bool,
    pub ignore_modules: Vec<String>,
    pub ignore_functions: Vec<String>,
    pub ignore_args: Vec<String>,
    pub production_mode: bool,
    pub minimal_capture: bool,
    /// Record format name (`json` or `msgpack`)
    pub backend: String,
    pub replay_mode: ReplayMode,
    /// Throttle threshold for captures of one function per process
    pub max_captures_per_function: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_path: PathBuf::from("./snap_capture"),
            default_retention: 2,
            default_overwrite: false,
            ignore_modules: Vec::new(),
            ignore_functions: Vec::new(),
            ignore_args: ["password", "token", "secret", "key", "auth"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            production_mode: false,
            minimal_capture: false,
            backend: "json".to_string(),
            replay_mode: ReplayMode::Record,
            max_captures_per_function: 100,
        }
    }
}

impl CaptureConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_vars(|key| std::env::var(key).ok());
        config
    }

    /// Defaults overlaid with a `.env` file and the process environment.
    ///
    /// `None` reads `./.env`. A missing file is not an error. The process
    /// environment is never modified; file values only fill variables the
    /// environment leaves unset.
    pub fn from_env_file(path: Option<&Path>) -> Self {
        let mut config = Self::default();
        config.apply_env_file(path);
        config
    }

    /// Defaults overlaid with a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid capture config TOML")
    }

    /// Full layered load: defaults, TOML, `.env`, environment
    pub fn load(toml_path: Option<&Path>, env_file: Option<&Path>) -> Result<Self> {
        let mut config = match toml_path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_file(env_file);
        Ok(config)
    }

    fn apply_env_file(&mut self, path: Option<&Path>) {
        let path = path.unwrap_or_else(|| Path::new(".env"));
        let file_vars = match std::fs::read_to_string(path) {
            Ok(content) => parse_env_file(&content),
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to read env file {}: {}", path.display(), err);
                }
                HashMap::new()
            }
        };
        self.apply_vars(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        });
    }

    /// Overlay `SNAP_CAPTURE_*` variables from an arbitrary lookup
    pub fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_ENABLED) {
            set_bool(&mut self.enabled, ENV_ENABLED, &v);
        }
        if let Some(v) = lookup(ENV_DEFAULT_PATH) {
            if !v.trim().is_empty() {
                self.default_path = PathBuf::from(v.trim());
            }
        }
        if let Some(v) = lookup(ENV_DEFAULT_RETENTION) {
            match v.trim().parse::<usize>() {
                Ok(n) => self.default_retention = n,
                Err(_) => tracing::warn!(
                    "Ignoring invalid {}={:?}, keeping {}",
                    ENV_DEFAULT_RETENTION,
                    v,
                    self.default_retention
                ),
            }
        }
        if let Some(v) = lookup(ENV_DEFAULT_OVERWRITE) {
            set_bool(&mut self.default_overwrite, ENV_DEFAULT_OVERWRITE, &v);
        }
        if let Some(v) = lookup(ENV_IGNORE_MODULES) {
            self.ignore_modules = parse_list(&v);
        }
        if let Some(v) = lookup(ENV_IGNORE_FUNCTIONS) {
            self.ignore_functions = parse_list(&v);
        }
        if let Some(v) = lookup(ENV_IGNORE_ARGS) {
            let list = parse_list(&v);
            if !list.is_empty() {
                self.ignore_args = list;
            }
        }
        if let Some(v) = lookup(ENV_PRODUCTION_MODE) {
            set_bool(&mut self.production_mode, ENV_PRODUCTION_MODE, &v);
        }
        if let Some(v) = lookup(ENV_MINIMAL) {
            set_bool(&mut self.minimal_capture, ENV_MINIMAL, &v);
        }
        if let Some(v) = lookup(ENV_BACKEND) {
            self.backend = v.trim().to_lowercase();
        }
        if let Some(v) = lookup(ENV_REPLAY_MODE) {
            match ReplayMode::parse(&v) {
                Some(mode) => self.replay_mode = mode,
                None => tracing::warn!("Ignoring unknown {}={:?}", ENV_REPLAY_MODE, v),
            }
        }
        if lookup(ENV_SIDE_EFFECT_CAPTURE).as_deref().map(str::trim) == Some("1") {
            self.replay_mode = ReplayMode::Record;
        }
    }

    /// Whether a function is excluded by the ignore lists
    pub fn is_function_ignored(&self, function_name: &str, module_name: &str) -> bool {
        compile_patterns(&self.ignore_modules)
            .iter()
            .any(|p| p.matches(module_name))
            || compile_patterns(&self.ignore_functions)
                .iter()
                .any(|p| p.matches(function_name))
    }

    pub fn should_capture(&self, function_name: &str, module_name: &str) -> bool {
        self.enabled && !self.is_function_ignored(function_name, module_name)
    }

    /// Minimal capture applies in production mode too
    pub fn effective_minimal(&self) -> bool {
        self.minimal_capture || self.production_mode
    }

    /// Record format, falling back to JSON for unknown names
    pub fn backend(&self) -> Backend {
        Backend::parse_lenient(&self.backend)
    }

    /// Storage root, preferring a per-call override
    pub fn capture_path(&self, custom: Option<&Path>) -> PathBuf {
        custom.map_or_else(|| self.default_path.clone(), Path::to_path_buf)
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn set_bool(slot: &mut bool, key: &str, value: &str) {
    match parse_bool(value) {
        Some(b) => *slot = b,
        None => tracing::warn!("Ignoring invalid {}={:?}, keeping {}", key, value, slot),
    }
}

/// Parse `KEY=VALUE` lines, skipping blanks and `#` comments
fn parse_env_file(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let key = key.trim().trim_start_matches("export ").trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.to_string(), value.to_string())
        })
        .collect()
}

static GLOBAL_CONFIG: OnceLock<RwLock<Arc<CaptureConfig>>> = OnceLock::new();

fn global_cell() -> &'static RwLock<Arc<CaptureConfig>> {
    GLOBAL_CONFIG.get_or_init(|| RwLock::new(Arc::new(CaptureConfig::from_env_file(None))))
}

/// Current process-wide configuration
pub fn global_config() -> Arc<CaptureConfig> {
    let guard = global_cell()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(&guard)
}

/// Replace the process-wide configuration, returning the previous one
pub fn set_global_config(config: CaptureConfig) -> Arc<CaptureConfig> {
    swap_global(Arc::new(config))
}

/// Rebuild the process-wide configuration from `.env` and the environment
pub fn reload_global_config() -> Arc<CaptureConfig> {
    swap_global(Arc::new(CaptureConfig::from_env_file(None)))
}

fn swap_global(config: Arc<CaptureConfig>) -> Arc<CaptureConfig> {
    let mut guard = global_cell()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::replace(&mut *guard, config)
}

/// Scoped replacement of the global configuration.
///
/// The previous configuration is restored when the guard drops.
///
/// ```
/// use snapcall::config::{global_config, ConfigOverride};
///
/// {
///     let _guard = ConfigOverride::modify(|c| c.enabled = false);
///     assert!(!global_config().enabled);
/// }
/// ```
#[must_use = "the override is reverted when the guard is dropped"]
pub struct ConfigOverride {
    previous: Option<Arc<CaptureConfig>>,
}

impl ConfigOverride {
    pub fn install(config: CaptureConfig) -> Self {
        Self {
            previous: Some(set_global_config(config)),
        }
    }

    /// Install a modified copy of the current configuration
    pub fn modify(change: impl FnOnce(&mut CaptureConfig)) -> Self {
        let mut config = (*global_config()).clone();
        change(&mut config);
        Self::install(config)
    }
}

impl Drop for ConfigOverride {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            swap_global(previous);
        }
    }
}
