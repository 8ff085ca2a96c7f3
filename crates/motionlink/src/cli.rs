//! Clap derive structures for the `motionlink` CLI.
//!
//! Defines the command tree, global flags and shared value types. This file
//! is also compiled by `build.rs` for man page generation, so it must not
//! reach into the rest of the crate.

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// motionlink -- control and observe devices on a shared motion server
#[derive(Debug, Parser)]
#[command(
    name = "motionlink",
    version,
    about = "Control and observe devices on a motionlink server",
    long_about = "Issue speed, pause, resume and step commands to devices managed by a\n\
        motionlink server, and watch their authoritative state as other\n\
        clients change it.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Server profile to use
    #[arg(long, short = 'p', env = "MOTIONLINK_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Server WebSocket URL (overrides profile)
    #[arg(long, short = 's', env = "MOTIONLINK_SERVER", global = true)]
    pub server: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "MOTIONLINK_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Command timeout, e.g. "5s" or "1500ms" (overrides profile)
    #[arg(long, env = "MOTIONLINK_TIMEOUT", value_parser = parse_duration, global = true)]
    pub timeout: Option<Duration>,
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let duration = humantime::parse_duration(raw).map_err(|e| e.to_string())?;
    if duration.is_zero() {
        return Err("timeout must be greater than zero".into());
    }
    Ok(duration)
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect the device mirror
    #[command(alias = "dev", alias = "d")]
    Devices(DevicesArgs),

    /// Show sync status and allowed commands per device
    #[command(alias = "st")]
    Status(StatusArgs),

    /// Follow device changes and events until interrupted
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Set a device's playback speed
    Speed(SpeedArgs),

    /// Pause an executing device
    Pause(DeviceTarget),

    /// Resume a paused device
    Resume(DeviceTarget),

    /// Step a device one increment
    Step(StepArgs),

    /// Request a full device snapshot from the server
    Refresh,

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Devices ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DevicesArgs {
    #[command(subcommand)]
    pub command: DevicesCommand,
}

#[derive(Debug, Subcommand)]
pub enum DevicesCommand {
    /// List all devices
    #[command(alias = "ls")]
    List,

    /// Show one device in detail
    Get {
        /// Device id or display name
        device: String,
    },
}

// ── Status / Watch ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Limit to one device (id or display name)
    pub device: Option<String>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Only follow this device (id or display name)
    #[arg(long, short = 'd')]
    pub device: Option<String>,

    /// Print playback, added and removed events as they arrive
    #[arg(long, short = 'e')]
    pub events: bool,
}

// ── Device commands ──────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DeviceTarget {
    /// Device id or display name
    pub device: String,
}

#[derive(Debug, Args)]
pub struct SpeedArgs {
    /// Device id or display name
    pub device: String,

    /// Speed as a percentage of nominal (0-100)
    #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
    pub percent: u8,
}

#[derive(Debug, Args)]
pub struct StepArgs {
    /// Device id or display name
    pub device: String,

    /// Step backward instead of forward
    #[arg(long, short = 'b')]
    pub backward: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create or update a profile and make it the default
    Init {
        /// Server WebSocket URL (ws:// or wss://)
        #[arg(long)]
        server: String,

        /// Profile name
        #[arg(long, default_value = "default")]
        name: String,
    },

    /// Display current resolved configuration
    Show,

    /// Print the config file location
    Path,

    /// Set a configuration value
    Set {
        /// Config key (e.g., "server", "command_timeout_ms", "reconnect.max_retries")
        key: String,

        /// Value to set
        value: String,
    },

    /// List configured profiles
    Profiles,

    /// Set the default profile
    Use {
        /// Profile name
        name: String,
    },
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
