//! Device command handlers: speed, pause, resume, step, refresh.
//!
//! Each resolves the device against the mirror, issues one command and
//! waits for it to be confirmed, rejected or timed out.

use motionlink_core::{CommandReceipt, CommandResult, Confirmation, DeviceId, Session};

use crate::cli::{DeviceTarget, GlobalOpts, SpeedArgs, StepArgs};
use crate::commands::util;
use crate::error::CliError;
use crate::output;

pub async fn speed(
    session: &Session,
    args: &SpeedArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let id = target(session, &args.device)?;
    report(session.set_speed(id, args.percent).await, global)
}

pub async fn pause(
    session: &Session,
    target_args: &DeviceTarget,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let id = target(session, &target_args.device)?;
    report(session.pause(id).await, global)
}

pub async fn resume(
    session: &Session,
    target_args: &DeviceTarget,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let id = target(session, &target_args.device)?;
    report(session.resume(id).await, global)
}

pub async fn step(session: &Session, args: &StepArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let id = target(session, &args.device)?;
    let result = if args.backward {
        session.step_backward(id).await
    } else {
        session.step_forward(id).await
    };
    report(result, global)
}

pub async fn refresh(session: &Session, global: &GlobalOpts) -> Result<(), CliError> {
    report(session.refresh_all().await, global)
}

// ── Helpers ──────────────────────────────────────────────────────────

fn target(session: &Session, query: &str) -> Result<DeviceId, CliError> {
    util::resolve_device(&session.snapshot(), query)
}

fn report(result: CommandResult, global: &GlobalOpts) -> Result<(), CliError> {
    let receipt = result?;
    tracing::debug!(command_id = %receipt.command_id, "command confirmed");
    let out = output::render_single(&global.output, &receipt, summary, |r| {
        r.command_id.to_string()
    });
    output::print_output(&out, global.quiet);
    Ok(())
}

fn summary(r: &CommandReceipt) -> String {
    let target = r
        .device_id
        .as_ref()
        .map_or_else(String::new, |id| format!(" on {id}"));
    let by = match &r.confirmation {
        Confirmation::Ack { .. } => "acknowledged".to_owned(),
        Confirmation::Broadcast { at } => format!("broadcast at {}", at.to_rfc3339()),
    };
    let elapsed = (r.confirmed_at - r.issued_at).num_milliseconds();
    format!("{}{target} confirmed ({by}, {elapsed}ms)", r.kind)
}
