//! Runtime configuration.
//!
//! Loaded from `~/.keyfleet/config.toml` unless a path is given. Every
//! field has a default, so an empty or missing file is a valid config.

use anyhow::{bail, Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overall deadline for one enroll or sign operation.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Delay before re-opening a device that answered busy.
const DEFAULT_OPEN_RETRY_MS: u64 = 200;

/// Delay before enumerating again when no device is usable.
const DEFAULT_ENUMERATE_RETRY_MS: u64 = 200;

/// Delay between enroll attempts while waiting for touch.
const DEFAULT_ENROLL_RETRY_MS: u64 = 200;

/// Delay between sign attempts while waiting for touch.
const DEFAULT_TOUCH_RETRY_MS: u64 = 200;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_open_retry_ms() -> u64 {
    DEFAULT_OPEN_RETRY_MS
}

fn default_enumerate_retry_ms() -> u64 {
    DEFAULT_ENUMERATE_RETRY_MS
}

fn default_enroll_retry_ms() -> u64 {
    DEFAULT_ENROLL_RETRY_MS
}

fn default_touch_retry_ms() -> u64 {
    DEFAULT_TOUCH_RETRY_MS
}

fn default_await_touch() -> bool {
    true
}

/// On-disk configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Deadline for a whole operation, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_open_retry_ms")]
    pub open_retry_ms: u64,
    #[serde(default = "default_enumerate_retry_ms")]
    pub enumerate_retry_ms: u64,
    #[serde(default = "default_enroll_retry_ms")]
    pub enroll_retry_ms: u64,
    #[serde(default = "default_touch_retry_ms")]
    pub touch_retry_ms: u64,
    /// Keep a sign operation open on a device that asked for touch,
    /// instead of returning the touch request to the caller.
    #[serde(default = "default_await_touch")]
    pub await_touch: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            open_retry_ms: DEFAULT_OPEN_RETRY_MS,
            enumerate_retry_ms: DEFAULT_ENUMERATE_RETRY_MS,
            enroll_retry_ms: DEFAULT_ENROLL_RETRY_MS,
            touch_retry_ms: DEFAULT_TOUCH_RETRY_MS,
            await_touch: default_await_touch(),
        }
    }
}

impl FleetConfig {
    /// `~/.keyfleet/config.toml`, if a home directory exists.
    pub fn default_path() -> Option<PathBuf> {
        UserDirs::new().map(|dirs| dirs.home_dir().join(".keyfleet").join("config.toml"))
    }

    /// Load from `path`, or from the default location.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_file(&path),
                _ => {
                    tracing::debug!("No config file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be greater than zero");
        }
        for (name, value) in [
            ("open_retry_ms", self.open_retry_ms),
            ("enumerate_retry_ms", self.enumerate_retry_ms),
            ("enroll_retry_ms", self.enroll_retry_ms),
            ("touch_retry_ms", self.touch_retry_ms),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn timing(&self) -> Timing {
        Timing {
            timeout: Duration::from_secs(self.timeout_secs),
            open_retry: Duration::from_millis(self.open_retry_ms),
            enumerate_retry: Duration::from_millis(self.enumerate_retry_ms),
            enroll_retry: Duration::from_millis(self.enroll_retry_ms),
            touch_retry: Duration::from_millis(self.touch_retry_ms),
        }
    }
}

/// Delays and deadline used by signers and coordinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub timeout: Duration,
    pub open_retry: Duration,
    pub enumerate_retry: Duration,
    pub enroll_retry: Duration,
    pub touch_retry: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        FleetConfig::default().timing()
    }
}
