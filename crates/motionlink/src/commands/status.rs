//! `status`: per-device sync status, outstanding commands and allowed
//! operations.

use serde::Serialize;
use tabled::Tabled;

use motionlink_core::{
    CommandKind, ConnectionInfo, DeviceId, PendingCommand, Session, SyncStatus,
};

use crate::cli::{GlobalOpts, OutputFormat, StatusArgs};
use crate::commands::util;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct DeviceStatus {
    device_id: DeviceId,
    sync_status: Option<SyncStatus>,
    pending_commands: usize,
    allowed_commands: Vec<CommandKind>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    connection: ConnectionInfo,
    anomalies: u64,
    devices: Vec<DeviceStatus>,
    pending: Vec<PendingCommand>,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Sync")]
    sync: String,
    #[tabled(rename = "Pending")]
    pending: usize,
    #[tabled(rename = "Allowed")]
    allowed: String,
}

impl From<&DeviceStatus> for StatusRow {
    fn from(s: &DeviceStatus) -> Self {
        let allowed = if s.allowed_commands.is_empty() {
            "-".to_owned()
        } else {
            s.allowed_commands
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        Self {
            device: s.device_id.to_string(),
            sync: output::sync_label(s.sync_status, false),
            pending: s.pending_commands,
            allowed,
        }
    }
}

pub fn handle(session: &Session, args: &StatusArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let snapshot = session.snapshot();
    let ids: Vec<DeviceId> = match &args.device {
        Some(query) => vec![util::resolve_device(&snapshot, query)?],
        None => snapshot.keys().cloned().collect(),
    };

    let pending = session.pending();
    let devices: Vec<DeviceStatus> = ids
        .into_iter()
        .map(|id| DeviceStatus {
            sync_status: session.sync_status(&id),
            pending_commands: pending
                .iter()
                .filter(|p| p.device_id.as_ref() == Some(&id))
                .count(),
            allowed_commands: session
                .allowed_commands(&id)
                .map(|a| a.iter().collect())
                .unwrap_or_default(),
            device_id: id,
        })
        .collect();

    let out = match global.output {
        OutputFormat::Table | OutputFormat::Plain => output::render_list(
            &global.output,
            &devices,
            |s| StatusRow::from(s),
            |s| format!("{} {}", s.device_id, output::sync_label(s.sync_status, false)),
        ),
        _ => {
            let report = StatusReport {
                connection: session.connection_info(),
                anomalies: session.anomaly_count(),
                devices,
                pending,
            };
            output::render_single(&global.output, &report, |_| String::new(), |_| String::new())
        }
    };
    output::print_output(&out, global.quiet);
    Ok(())
}
