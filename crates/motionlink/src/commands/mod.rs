//! Command dispatch: bridges CLI args -> session operations -> output formatting.

pub mod config_cmd;
pub mod control;
pub mod devices;
pub mod status;
pub mod util;
pub mod watch;

use motionlink_core::Session;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a one-shot, session-bound command to its handler.
pub async fn dispatch(
    cmd: Command,
    session: &Session,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        Command::Devices(args) => devices::handle(session, args, global),
        Command::Status(args) => status::handle(session, &args, global),
        Command::Speed(args) => control::speed(session, &args, global).await,
        Command::Pause(target) => control::pause(session, &target, global).await,
        Command::Resume(target) => control::resume(session, &target, global).await,
        Command::Step(args) => control::step(session, &args, global).await,
        Command::Refresh => control::refresh(session, global).await,
        // Handled before a session exists
        Command::Watch(_) | Command::Config(_) | Command::Completions(_) => Err(CliError::Internal(
            "command does not run inside a one-shot session".into(),
        )),
    }
}
