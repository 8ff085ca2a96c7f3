//! CLI configuration: a thin wrapper around `motionlink_config`.
//!
//! Re-exports the shared types and layers `GlobalOpts` overrides
//! (`--server`, `--timeout`) on top of the resolved profile.

use motionlink_core::SessionConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

// ── Re-exports from shared crate ────────────────────────────────────

pub use motionlink_config::{
    Config, Profile, config_path, load_config, parse_server_url, profile_to_session_config,
    save_config,
};

// ── CLI-specific helpers ────────────────────────────────────────────

/// Resolve the active profile name from CLI flags and config.
pub fn active_profile_name(global: &GlobalOpts, config: &Config) -> String {
    config.profile_name(global.profile.as_deref())
}

/// Build the session configuration for this invocation.
///
/// Flag overrides beat the profile. `--server` alone is enough when no
/// profile exists; an explicitly named profile must exist.
pub fn resolve_session_config(
    global: &GlobalOpts,
    config: &Config,
) -> Result<SessionConfig, CliError> {
    let name = active_profile_name(global, config);

    let mut profile = match (config.profiles.get(&name), &global.server) {
        (Some(profile), _) => profile.clone(),
        (None, Some(server)) if global.profile.is_none() => Profile::new(server.clone()),
        (None, _) if global.profile.is_some() => {
            return Err(CliError::ProfileNotFound {
                name,
                available: available_profiles(config),
            });
        }
        (None, _) => {
            return Err(CliError::NoConfig {
                path: config_path().display().to_string(),
            });
        }
    };

    if let Some(server) = &global.server {
        profile.server.clone_from(server);
    }

    let mut session = profile_to_session_config(&profile, &config.defaults)?;
    if let Some(timeout) = global.timeout {
        session.command_timeout = timeout;
    }
    Ok(session)
}

pub fn available_profiles(config: &Config) -> String {
    if config.profiles.is_empty() {
        return "(none)".into();
    }
    config
        .profiles
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
