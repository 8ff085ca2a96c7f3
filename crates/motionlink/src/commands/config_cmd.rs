//! Config subcommand handlers.

use serde::Serialize;
use tabled::Tabled;

use motionlink_core::BackoffStrategy;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::config::{self, Config, Profile};
use crate::error::CliError;
use crate::output;

// ── Helpers ─────────────────────────────────────────────────────────

fn save_config(cfg: &Config) -> Result<(), CliError> {
    config::save_config(cfg)?;
    Ok(())
}

fn invalid(key: &str, reason: impl Into<String>) -> CliError {
    CliError::Validation {
        field: key.into(),
        reason: reason.into(),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, CliError> {
    value
        .parse()
        .map_err(|_| invalid(key, format!("expected a whole number, got '{value}'")))
}

/// `none` (or an empty string) clears an optional setting.
fn parse_optional_u64(key: &str, value: &str) -> Result<Option<u64>, CliError> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_u64(key, value).map(Some)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CliError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, format!("expected true or false, got '{value}'"))),
    }
}

fn parse_strategy(key: &str, value: &str) -> Result<BackoffStrategy, CliError> {
    value.parse().map_err(|_| {
        invalid(
            key,
            format!("expected 'fixed' or 'exponential', got '{value}'"),
        )
    })
}

fn profile_mut<'a>(cfg: &'a mut Config, name: &str) -> Result<&'a mut Profile, CliError> {
    let available = config::available_profiles(cfg);
    cfg.profiles
        .get_mut(name)
        .ok_or_else(|| CliError::ProfileNotFound {
            name: name.into(),
            available,
        })
}

/// Apply one `config set`. Bare keys address the active profile;
/// `defaults.*` and `default_profile` address the top level.
fn apply_setting(
    cfg: &mut Config,
    profile_name: &str,
    key: &str,
    value: &str,
) -> Result<(), CliError> {
    match key {
        "default_profile" => {
            if !cfg.profiles.contains_key(value) {
                return Err(CliError::ProfileNotFound {
                    name: value.into(),
                    available: config::available_profiles(cfg),
                });
            }
            cfg.default_profile = Some(value.into());
        }
        "defaults.output" => cfg.defaults.output = value.into(),
        "defaults.color" => cfg.defaults.color = value.into(),
        "defaults.command_timeout_ms" => cfg.defaults.command_timeout_ms = parse_u64(key, value)?,
        "defaults.staleness_ms" => cfg.defaults.staleness_ms = parse_u64(key, value)?,
        "defaults.freshness_ms" => cfg.defaults.freshness_ms = parse_optional_u64(key, value)?,
        "defaults.sweep_ms" => cfg.defaults.sweep_ms = parse_u64(key, value)?,
        _ => {
            let profile = profile_mut(cfg, profile_name)?;
            match key {
                "server" => {
                    config::parse_server_url(value)?;
                    profile.server = value.into();
                }
                "command_timeout_ms" => {
                    profile.command_timeout_ms = parse_optional_u64(key, value)?;
                }
                "staleness_ms" => profile.staleness_ms = parse_optional_u64(key, value)?,
                "freshness_ms" => profile.freshness_ms = parse_optional_u64(key, value)?,
                "reconnect.enabled" => profile.reconnect.enabled = parse_bool(key, value)?,
                "reconnect.strategy" => profile.reconnect.strategy = parse_strategy(key, value)?,
                "reconnect.initial_delay_ms" => {
                    profile.reconnect.initial_delay_ms = parse_u64(key, value)?;
                }
                "reconnect.max_delay_ms" => profile.reconnect.max_delay_ms = parse_u64(key, value)?,
                "reconnect.max_retries" => {
                    profile.reconnect.max_retries = parse_optional_u64(key, value)?
                        .map(u32::try_from)
                        .transpose()
                        .map_err(|_| invalid(key, "too large"))?;
                }
                _ => return Err(invalid("key", format!("unknown config key '{key}'"))),
            }
        }
    }

    // Reject combinations the session would refuse (zero timeouts, etc.)
    for profile in cfg.profiles.values() {
        config::profile_to_session_config(profile, &cfg.defaults)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct ProfileEntry {
    name: String,
    server: String,
    default: bool,
}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "")]
    marker: &'static str,
    #[tabled(rename = "Profile")]
    name: String,
    #[tabled(rename = "Server")]
    server: String,
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init { server, name } => {
            config::parse_server_url(&server)?;
            let mut cfg = config::load_config()?;
            cfg.profiles
                .entry(name.clone())
                .and_modify(|p| p.server.clone_from(&server))
                .or_insert_with(|| Profile::new(server.clone()));
            cfg.default_profile = Some(name.clone());
            save_config(&cfg)?;

            if !global.quiet {
                eprintln!(
                    "Profile '{name}' ({server}) saved to {}",
                    config::config_path().display()
                );
            }
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = config::load_config()?;
            let out = match global.output {
                OutputFormat::Table | OutputFormat::Plain => {
                    toml::to_string_pretty(&cfg).map_err(motionlink_config::ConfigError::from)?
                }
                _ => output::render_single(
                    &global.output,
                    &cfg,
                    |_| String::new(),
                    |_| String::new(),
                ),
            };
            output::print_output(out.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&config::config_path().display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Set { key, value } => {
            let mut cfg = config::load_config()?;
            let profile_name = config::active_profile_name(global, &cfg);
            apply_setting(&mut cfg, &profile_name, &key, &value)?;
            save_config(&cfg)?;
            if !global.quiet {
                eprintln!("Set {key} = {value}");
            }
            Ok(())
        }

        ConfigCommand::Profiles => {
            let cfg = config::load_config()?;
            let default = config::active_profile_name(global, &cfg);
            let entries: Vec<ProfileEntry> = cfg
                .profiles
                .iter()
                .map(|(name, p)| ProfileEntry {
                    default: *name == default,
                    name: name.clone(),
                    server: p.server.clone(),
                })
                .collect();
            let out = output::render_list(
                &global.output,
                &entries,
                |e| ProfileRow {
                    marker: if e.default { "*" } else { "" },
                    name: e.name.clone(),
                    server: e.server.clone(),
                },
                |e| e.name.clone(),
            );
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::Use { name } => {
            let mut cfg = config::load_config()?;
            apply_setting(&mut cfg, &name, "default_profile", &name)?;
            save_config(&cfg)?;
            if !global.quiet {
                eprintln!("Default profile set to '{name}'");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut cfg = Config::default();
        cfg.profiles
            .insert("default".into(), Profile::new("ws://a:9000/ws"));
        cfg.profiles.insert("lab".into(), Profile::new("ws://b:9000/ws"));
        cfg
    }

    #[test]
    fn sets_profile_and_default_keys() {
        let mut cfg = cfg();
        apply_setting(&mut cfg, "lab", "command_timeout_ms", "8000").unwrap();
        apply_setting(&mut cfg, "lab", "reconnect.strategy", "fixed").unwrap();
        apply_setting(&mut cfg, "lab", "reconnect.max_retries", "3").unwrap();
        apply_setting(&mut cfg, "lab", "defaults.freshness_ms", "10000").unwrap();

        let lab = &cfg.profiles["lab"];
        assert_eq!(lab.command_timeout_ms, Some(8000));
        assert_eq!(lab.reconnect.strategy, BackoffStrategy::Fixed);
        assert_eq!(lab.reconnect.max_retries, Some(3));
        assert_eq!(cfg.defaults.freshness_ms, Some(10_000));
        assert_eq!(cfg.profiles["default"].command_timeout_ms, None);

        apply_setting(&mut cfg, "lab", "reconnect.max_retries", "none").unwrap();
        assert_eq!(cfg.profiles["lab"].reconnect.max_retries, None);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = cfg();
        assert!(apply_setting(&mut cfg, "lab", "server", "http://b/ws").is_err());
        assert!(apply_setting(&mut cfg, "lab", "staleness_ms", "soon").is_err());
        assert!(apply_setting(&mut cfg, "lab", "command_timeout_ms", "0").is_err());
        assert!(apply_setting(&mut cfg, "lab", "colour", "red").is_err());
        assert!(matches!(
            apply_setting(&mut cfg, "ghost", "server", "ws://c/ws"),
            Err(CliError::ProfileNotFound { .. })
        ));
        assert!(matches!(
            apply_setting(&mut cfg, "lab", "default_profile", "ghost"),
            Err(CliError::ProfileNotFound { .. })
        ));
    }
}
