//! `moonwire config`: create and inspect printer profiles.

use std::fmt::Write as _;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::config::{self, Profile};
use crate::error::CliError;
use crate::output;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init {
            host,
            port,
            tls,
            api_key_env,
            default,
        } => {
            let mut cfg = config::load_config_or_default();
            let name = global.profile.clone().unwrap_or_else(|| "default".into());

            let mut profile = Profile::new(host);
            profile.port = port;
            profile.tls = tls;
            profile.api_key_env = api_key_env;
            // Validate before writing anything.
            let url = profile.websocket_url()?;

            let make_default = default
                || cfg
                    .default_profile
                    .as_ref()
                    .is_none_or(|d| !cfg.profiles.contains_key(d));
            if make_default {
                cfg.default_profile = Some(name.clone());
            }
            cfg.profiles.insert(name.clone(), profile);

            let path = config::save_config(&cfg)?;
            output::print_output(
                &format!("Saved profile '{name}' ({url}) to {}", path.display()),
                global.quiet,
            );
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = moonwire_config::load_config()?;
            let color = output::should_color(global.color);
            let out = output::render(global.output, &cfg, |cfg| summary(cfg, color))?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&config::config_path().display().to_string(), global.quiet);
            Ok(())
        }
    }
}

fn summary(cfg: &config::Config, color: bool) -> String {
    if cfg.profiles.is_empty() {
        return "No profiles configured. Create one with: moonwire config init --host <host>".into();
    }

    let mut out = String::new();
    for (name, profile) in &cfg.profiles {
        let marker = if cfg.default_profile.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        let _ = writeln!(out, "{}{marker}", output::heading(name, color));
        let url = profile
            .websocket_url()
            .map_or_else(|e| e.to_string(), |u| u.to_string());
        let _ = writeln!(out, "{}", output::field("url", url, 10));
        let key = match (&profile.api_key_env, &profile.api_key) {
            (Some(env), _) => format!("${env}"),
            (None, Some(_)) => "(plaintext)".into(),
            (None, None) => "(keyring or none)".into(),
        };
        let _ = writeln!(out, "{}", output::field("api key", key, 10));
    }
    out.trim_end().to_owned()
}
