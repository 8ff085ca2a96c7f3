//! Device command handlers.

use std::sync::Arc;

use serde::Serialize;
use tabled::Tabled;

use motionlink_core::{CommandKind, DeviceState, Session, SyncStatus};

use crate::cli::{DevicesArgs, DevicesCommand, GlobalOpts};
use crate::commands::util;
use crate::error::CliError;
use crate::output;

/// A device record plus what the client currently knows about it.
#[derive(Debug, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub state: Arc<DeviceState>,
    pub sync_status: Option<SyncStatus>,
    pub allowed_commands: Vec<CommandKind>,
}

impl DeviceView {
    pub fn build(session: &Session, state: Arc<DeviceState>) -> Self {
        let allowed_commands = session
            .allowed_commands(&state.id)
            .map(|allowed| allowed.iter().collect())
            .unwrap_or_default();
        Self {
            sync_status: session.sync_status(&state.id),
            allowed_commands,
            state,
        }
    }
}

// ── Table row ────────────────────────────────────────────────────────

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Speed")]
    speed: String,
    #[tabled(rename = "Dir")]
    direction: String,
    #[tabled(rename = "Sync")]
    sync: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&DeviceView> for DeviceRow {
    fn from(v: &DeviceView) -> Self {
        Self {
            id: v.state.id.to_string(),
            name: v.state.display_name.clone(),
            state: v.state.execution_state.to_string(),
            speed: format!("{}%", v.state.speed_percent),
            direction: v.state.direction.to_string(),
            sync: output::sync_label(v.sync_status, false),
            error: v.state.last_error.clone().unwrap_or_default(),
        }
    }
}

fn detail(v: &DeviceView) -> String {
    let d = &v.state;
    let allowed = if v.allowed_commands.is_empty() {
        "-".to_owned()
    } else {
        v.allowed_commands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    [
        format!("ID:          {}", d.id),
        format!("Name:        {}", d.display_name),
        format!("State:       {}", d.execution_state),
        format!("Speed:       {}%", d.speed_percent),
        format!("Direction:   {}", d.direction),
        format!("Can pause:   {}", d.can_pause),
        format!("Can resume:  {}", d.can_resume),
        format!("Step fwd:    {}", d.can_step_forward),
        format!("Step back:   {}", d.can_step_backward),
        format!("Sync:        {}", output::sync_label(v.sync_status, false)),
        format!("Allowed:     {allowed}"),
        format!(
            "Updated:     {}",
            d.last_authoritative_update_at
                .map_or_else(|| "-".into(), |t| t.to_rfc3339())
        ),
        format!("Error:       {}", d.last_error.as_deref().unwrap_or("-")),
    ]
    .join("\n")
}

// ── Handler ──────────────────────────────────────────────────────────

pub fn handle(session: &Session, args: DevicesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        DevicesCommand::List => {
            let views: Vec<DeviceView> = session
                .snapshot()
                .values()
                .map(|state| DeviceView::build(session, Arc::clone(state)))
                .collect();
            let out = output::render_list(
                &global.output,
                &views,
                |v| DeviceRow::from(v),
                |v| v.state.id.to_string(),
            );
            output::print_output(&out, global.quiet);
            Ok(())
        }

        DevicesCommand::Get { device } => {
            let snapshot = session.snapshot();
            let id = util::resolve_device(&snapshot, &device)?;
            let state = session.device(&id).ok_or_else(|| CliError::NotFound {
                resource_type: "device".into(),
                identifier: device.clone(),
                list_command: "devices list".into(),
            })?;
            let view = DeviceView::build(session, state);
            let out = output::render_single(&global.output, &view, detail, |v| {
                v.state.id.to_string()
            });
            output::print_output(&out, global.quiet);
            Ok(())
        }
    }
}
