//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a stable exit code.

use miette::Diagnostic;
use thiserror::Error;

use motionlink_config::ConfigError;
use motionlink_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const NOT_ALLOWED: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to device server at {url}")]
    #[diagnostic(
        code(motionlink::connection_failed),
        help(
            "Check that the server is running and reachable.\n\
             Reason: {reason}"
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Connection to the device server was lost")]
    #[diagnostic(
        code(motionlink::disconnected),
        help("The command may or may not have taken effect. Run: motionlink status")
    )]
    Disconnected,

    // ── Commands ─────────────────────────────────────────────────────
    #[error("{command} is not allowed while {device} is {state}")]
    #[diagnostic(
        code(motionlink::not_allowed),
        help("Nothing was sent. Run: motionlink status {device}")
    )]
    NotAllowed {
        device: String,
        command: String,
        state: String,
    },

    #[error("Server rejected command {command_id}: {reason}")]
    #[diagnostic(code(motionlink::rejected))]
    Rejected { command_id: String, reason: String },

    #[error("Command {command_id} was not confirmed within {timeout_ms}ms")]
    #[diagnostic(
        code(motionlink::command_timeout),
        help(
            "The outcome is unknown; the device may still apply it.\n\
             Run: motionlink status, or raise --timeout"
        )
    )]
    CommandTimeout { command_id: String, timeout_ms: u64 },

    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    #[diagnostic(code(motionlink::timeout), help("Raise --timeout or check the server"))]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Device {device} was removed by the server")]
    #[diagnostic(code(motionlink::device_removed))]
    DeviceRemoved { device: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(motionlink::not_found),
        help("Run: motionlink {list_command}")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    // ── Input ────────────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(motionlink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("No server configured")]
    #[diagnostic(
        code(motionlink::no_config),
        help(
            "Create a profile with: motionlink config init --server ws://host:9000/ws\n\
             Or pass --server / set MOTIONLINK_SERVER.\n\
             Config file: {path}"
        )
    )]
    NoConfig { path: String },

    #[error("Profile '{name}' not found")]
    #[diagnostic(
        code(motionlink::profile_not_found),
        help("Available profiles: {available}")
    )]
    ProfileNotFound { name: String, available: String },

    #[error(transparent)]
    #[diagnostic(code(motionlink::config))]
    Config(ConfigError),

    // ── Protocol / internal ──────────────────────────────────────────
    #[error("Protocol error: {message}")]
    #[diagnostic(
        code(motionlink::protocol),
        help("The server sent something this client does not understand. Retry with -vv.")
    )]
    Protocol { message: String },

    #[error("{0}")]
    #[diagnostic(code(motionlink::internal))]
    Internal(String),

    #[error(transparent)]
    #[diagnostic(code(motionlink::io))]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected => exit_code::CONNECTION,
            Self::NotFound { .. } | Self::DeviceRemoved { .. } => exit_code::NOT_FOUND,
            Self::NotAllowed { .. } => exit_code::NOT_ALLOWED,
            Self::CommandTimeout { .. } | Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::ProfileNotFound { .. } => exit_code::USAGE,
            Self::Config(ConfigError::Validation { .. } | ConfigError::UnknownProfile { .. }) => {
                exit_code::USAGE
            }
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Capability {
                device_id,
                kind,
                state,
            } => CliError::NotAllowed {
                device: device_id.to_string(),
                command: kind.to_string(),
                state: state.to_string(),
            },

            CoreError::ServerRejection { command_id, reason } => CliError::Rejected {
                command_id: command_id.to_string(),
                reason,
            },

            CoreError::CommandTimeout {
                command_id,
                timeout_ms,
            } => CliError::CommandTimeout {
                command_id: command_id.to_string(),
                timeout_ms,
            },

            CoreError::ConnectionLost { .. }
            | CoreError::ConnectionClosed
            | CoreError::NotConnected => CliError::Disconnected,

            CoreError::DeviceRemoved { device_id } => CliError::DeviceRemoved {
                device: device_id.to_string(),
            },

            CoreError::DeviceNotFound { device_id } => CliError::NotFound {
                resource_type: "device".into(),
                identifier: device_id.to_string(),
                list_command: "devices list".into(),
            },

            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "command".into(),
                reason: message,
            },

            CoreError::ConnectionFailed { url, reason } => {
                CliError::ConnectionFailed { url, reason }
            }

            CoreError::Timeout { what, timeout_ms } => CliError::Timeout { what, timeout_ms },

            CoreError::Protocol { message } => CliError::Protocol { message },

            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },

            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            other => CliError::Config(other),
        }
    }
}
