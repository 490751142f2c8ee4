//! Shared configuration for moonwire tools.
//!
//! TOML printer profiles, API key resolution (env + keyring + plaintext),
//! and translation to `moonwire_api::ClientConfig`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use moonwire_api::{ClientConfig, ReconnectPolicy, TimeoutSettings};

/// Keyring service name; entries are keyed `<profile>/api-key`.
const KEYRING_SERVICE: &str = "moonwire";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },

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
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    /// Named printer profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            profiles: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::ProfileNotFound { name: name.into() })
    }
}

/// A named Moonraker instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    /// Hostname or IP of the Moonraker server.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Connect with `wss://` instead of `ws://`.
    #[serde(default)]
    pub tls: bool,

    /// API key (plaintext; prefer keyring or env var).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable name containing the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_min_delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_max_delay_ms: Option<u64>,

    /// `0` retries forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_max_attempts: Option<u32>,
}

fn default_port() -> u16 {
    7125
}

impl Profile {
    /// A profile for `host` with every other field defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            tls: false,
            api_key: None,
            api_key_env: None,
            connection_timeout_ms: None,
            request_timeout_ms: None,
            keepalive_interval_ms: None,
            reconnect_min_delay_ms: None,
            reconnect_max_delay_ms: None,
            reconnect_max_attempts: None,
        }
    }

    /// `ws://host:port/websocket`, or `wss://` when `tls` is set.
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "host".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::Validation {
                field: "port".into(),
                reason: "must be between 1 and 65535".into(),
            });
        }

        let scheme = if self.tls { "wss" } else { "ws" };
        let raw = format!("{scheme}://{}:{}/websocket", self.host, self.port);
        raw.parse().map_err(|e| ConfigError::Validation {
            field: "host".into(),
            reason: format!("{raw}: {e}"),
        })
    }

    /// Overlay this profile's timing overrides on the library defaults.
    pub fn timeouts(&self) -> Result<TimeoutSettings, ConfigError> {
        let defaults = TimeoutSettings::default();
        let millis = |field: &str, value: Option<u64>, default: Duration| match value {
            Some(0) => Err(ConfigError::Validation {
                field: field.into(),
                reason: "must be greater than zero".into(),
            }),
            Some(ms) => Ok(Duration::from_millis(ms)),
            None => Ok(default),
        };

        let reconnect = ReconnectPolicy {
            min_delay: millis(
                "reconnect_min_delay_ms",
                self.reconnect_min_delay_ms,
                defaults.reconnect.min_delay,
            )?,
            max_delay: millis(
                "reconnect_max_delay_ms",
                self.reconnect_max_delay_ms,
                defaults.reconnect.max_delay,
            )?,
            max_attempts: self
                .reconnect_max_attempts
                .unwrap_or(defaults.reconnect.max_attempts),
        };
        if reconnect.min_delay > reconnect.max_delay {
            return Err(ConfigError::Validation {
                field: "reconnect_min_delay_ms".into(),
                reason: "must not exceed reconnect_max_delay_ms".into(),
            });
        }

        Ok(TimeoutSettings {
            connection_timeout: millis(
                "connection_timeout_ms",
                self.connection_timeout_ms,
                defaults.connection_timeout,
            )?,
            request_timeout: millis(
                "request_timeout_ms",
                self.request_timeout_ms,
                defaults.request_timeout,
            )?,
            keepalive_interval: millis(
                "keepalive_interval_ms",
                self.keepalive_interval_ms,
                defaults.keepalive_interval,
            )?,
            reconnect,
        })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "moonwire", "moonwire").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("moonwire");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load config from `path`, layered as defaults, file, then `MOONWIRE_*`
/// environment variables. A missing file is not an error.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("MOONWIRE_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if it can't be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(&path, cfg)?;
    Ok(path)
}

pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the profile's API key, if any.
///
/// Moonraker commonly runs without authentication, so no key is not an
/// error. Lookup order: `api_key_env`, system keyring, plaintext.
pub fn resolve_api_key(profile: &Profile, profile_name: &str) -> Option<SecretString> {
    // 1. Profile's api_key_env → env var lookup
    if let Some(ref env_name) = profile.api_key_env {
        if let Ok(val) = std::env::var(env_name) {
            return Some(SecretString::from(val));
        }
        debug!(env = %env_name, "api key variable not set");
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/api-key")) {
        if let Ok(secret) = entry.get_password() {
            return Some(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    profile.api_key.clone().map(SecretString::from)
}

/// Build the WebSocket URL and `ClientConfig` for a profile.
pub fn profile_to_client_config(
    profile: &Profile,
    profile_name: &str,
) -> Result<(Url, ClientConfig), ConfigError> {
    let url = profile.websocket_url()?;
    let config = ClientConfig {
        timeouts: profile.timeouts()?,
        api_key: resolve_api_key(profile, profile_name),
    };
    Ok((url, config))
}

// ── Tests ───────────────────────────────────────────────────────────
