//! CLI configuration: thin wrapper around `moonwire_config`.
//!
//! Adds resolution that respects `GlobalOpts` flag overrides
//! (--url, --api-key, --timeout).

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use moonwire_api::ClientConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub use moonwire_config::{Config, Profile, config_path, load_config_or_default, save_config};

/// Resolve the active profile name from CLI flags and config.
pub fn active_profile_name(global: &GlobalOpts, config: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Build the WebSocket URL and client config from the profile plus flags.
///
/// `--url` works without any config file; otherwise the active profile
/// must exist.
pub fn resolve_connection(global: &GlobalOpts) -> Result<(Url, ClientConfig), CliError> {
    let cfg = load_config_or_default();
    let profile_name = active_profile_name(global, &cfg);

    let (url, mut client_config) = match (cfg.profiles.get(&profile_name), &global.url) {
        (Some(profile), url_flag) => {
            let (profile_url, client_config) =
                moonwire_config::profile_to_client_config(profile, &profile_name)?;
            let url = match url_flag {
                Some(raw) => parse_url(raw)?,
                None => profile_url,
            };
            (url, client_config)
        }
        (None, Some(raw)) => (parse_url(raw)?, ClientConfig::default()),
        (None, None) if global.profile.is_some() => {
            return Err(CliError::ProfileNotFound {
                name: profile_name,
                available: available_profiles(&cfg),
            });
        }
        (None, None) => {
            return Err(CliError::NoConfig {
                path: config_path().display().to_string(),
            });
        }
    };

    if let Some(ref key) = global.api_key {
        client_config.api_key = Some(SecretString::from(key.clone()));
    }
    if let Some(secs) = global.timeout {
        if secs == 0 {
            return Err(CliError::Validation {
                field: "timeout".into(),
                reason: "must be greater than zero".into(),
            });
        }
        client_config.timeouts.request_timeout = Duration::from_secs(secs);
    }

    Ok((url, client_config))
}

fn parse_url(raw: &str) -> Result<Url, CliError> {
    let url: Url = raw.parse().map_err(|_| CliError::Validation {
        field: "url".into(),
        reason: format!("invalid URL: {raw}"),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(CliError::Validation {
            field: "url".into(),
            reason: format!("expected ws:// or wss://, got {}://", url.scheme()),
        });
    }
    Ok(url)
}

fn available_profiles(cfg: &Config) -> String {
    if cfg.profiles.is_empty() {
        "(none)".into()
    } else {
        cfg.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}
