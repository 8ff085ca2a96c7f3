//! Shared configuration for motionlink tools.
//!
//! TOML profiles, one per device server, merged with `MOTIONLINK_*`
//! environment variables and translated into `motionlink_core::SessionConfig`.
//! The CLI layers its flag overrides on top.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use motionlink_core::{BackoffStrategy, ReconnectConfig, SessionConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{profile}' not found")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named server profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Name of the profile to use: `name`, else `default_profile`, else
    /// `"default"`.
    pub fn profile_name(&self, name: Option<&str>) -> String {
        name.map(str::to_owned)
            .or_else(|| self.default_profile.clone())
            .unwrap_or_else(|| "default".into())
    }

    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_color")]
    pub color: String,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,

    /// Unset means a quiet device never ages out of `synchronized`.
    #[serde(default)]
    pub freshness_ms: Option<u64>,

    #[serde(default = "default_sweep_ms")]
    pub sweep_ms: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            color: default_color(),
            command_timeout_ms: default_command_timeout_ms(),
            staleness_ms: default_staleness_ms(),
            freshness_ms: None,
            sweep_ms: default_sweep_ms(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_color() -> String {
    "auto".into()
}
fn default_command_timeout_ms() -> u64 {
    5_000
}
fn default_staleness_ms() -> u64 {
    3_000
}
fn default_sweep_ms() -> u64 {
    1_000
}

/// A named device-server profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    /// WebSocket endpoint (e.g., "ws://cell-4.local:9000/ws").
    pub server: String,

    /// Override the default command timeout.
    pub command_timeout_ms: Option<u64>,

    /// Override the default staleness window.
    pub staleness_ms: Option<u64>,

    /// Override the default freshness window.
    pub freshness_ms: Option<u64>,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Profile {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            command_timeout_ms: None,
            staleness_ms: None,
            freshness_ms: None,
            reconnect: ReconnectSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub strategy: BackoffStrategy,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Unset means retry forever.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "motionlink", "motionlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("motionlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file + environment. A missing file is not an
/// error; defaults apply.
///
/// Nested keys use a double underscore:
/// `MOTIONLINK_DEFAULTS__COMMAND_TIMEOUT_MS=8000`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("MOTIONLINK_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if it cannot be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Check and parse a server endpoint.
pub fn parse_server_url(server: &str) -> Result<url::Url, ConfigError> {
    let url: url::Url = server.parse().map_err(|_| ConfigError::Validation {
        field: "server".into(),
        reason: format!("invalid URL: {server}"),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::Validation {
            field: "server".into(),
            reason: format!("expected a ws:// or wss:// URL, got scheme '{other}'"),
        }),
    }
}

fn positive_ms(field: &str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_millis(ms))
}

impl ReconnectSettings {
    pub fn to_reconnect_config(&self) -> Result<ReconnectConfig, ConfigError> {
        let initial_delay = positive_ms("reconnect.initial_delay_ms", self.initial_delay_ms)?;
        let max_delay = positive_ms("reconnect.max_delay_ms", self.max_delay_ms)?;
        if max_delay < initial_delay {
            return Err(ConfigError::Validation {
                field: "reconnect.max_delay_ms".into(),
                reason: "must not be less than initial_delay_ms".into(),
            });
        }
        Ok(ReconnectConfig {
            enabled: self.enabled,
            strategy: self.strategy,
            initial_delay,
            max_delay,
            max_retries: self.max_retries,
        })
    }
}

/// Build a `SessionConfig` from a profile, falling back to `defaults`.
pub fn profile_to_session_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<SessionConfig, ConfigError> {
    let url = parse_server_url(&profile.server)?;

    let command_timeout = positive_ms(
        "command_timeout_ms",
        profile.command_timeout_ms.unwrap_or(defaults.command_timeout_ms),
    )?;
    let staleness_window = positive_ms(
        "staleness_ms",
        profile.staleness_ms.unwrap_or(defaults.staleness_ms),
    )?;
    let freshness_window = profile
        .freshness_ms
        .or(defaults.freshness_ms)
        .map(|ms| positive_ms("freshness_ms", ms))
        .transpose()?;
    let sweep_interval = positive_ms("sweep_ms", defaults.sweep_ms)?;

    Ok(SessionConfig {
        url,
        command_timeout,
        staleness_window,
        freshness_window,
        sweep_interval,
        reconnect: profile.reconnect.to_reconnect_config()?,
    })
}
