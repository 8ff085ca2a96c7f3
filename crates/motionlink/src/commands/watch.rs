//! `watch`: follow the device mirror until interrupted.
//!
//! Unlike the one-shot commands this keeps the session's reconnect policy,
//! so a dropped server shows up as a connection line followed by a fresh
//! snapshot once it comes back.

use std::sync::Arc;

use chrono::Utc;
use owo_colors::OwoColorize;
use tokio::sync::broadcast::error::RecvError;

use motionlink_core::{
    ConnectionState, DeviceId, DeviceMap, DeviceState, Event, EventKind, Session, SessionConfig,
};

use crate::cli::{GlobalOpts, WatchArgs};
use crate::commands::devices::DeviceView;
use crate::commands::util;
use crate::error::CliError;
use crate::output;

pub async fn handle(
    args: &WatchArgs,
    config: SessionConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let wait = config.command_timeout;
    let session = Session::new(config)?;
    session.connect().await?;

    let result = follow(&session, args, global, wait).await;
    session.disconnect().await;
    result
}

async fn follow(
    session: &Session,
    args: &WatchArgs,
    global: &GlobalOpts,
    wait: std::time::Duration,
) -> Result<(), CliError> {
    let color = output::should_color(&global.color);
    let printer = Printer {
        session,
        global,
        color,
    };

    let initial = session.wait_for_snapshot(wait).await?;
    let only = args
        .device
        .as_deref()
        .map(|q| util::resolve_device(&initial, q))
        .transpose()?;

    let mut devices = session.devices();
    let mut events = session.events();
    let mut connection = session.connection_state();
    connection.mark_unchanged();

    let mut previous = devices.current().clone();
    for state in previous.values() {
        if wanted(only.as_ref(), &state.id) {
            printer.device(Arc::clone(state));
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::debug!("interrupted");
                return Ok(());
            }

            changed = devices.changed() => {
                let Some(current) = changed else {
                    return Err(CliError::Disconnected);
                };
                printer.diff(&previous, &current, only.as_ref());
                previous = current;
            }

            received = events.recv(), if args.events => match received {
                Ok(event) if wanted(only.as_ref(), &event.device_id) => printer.event(&event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event feed lagged");
                }
                Err(RecvError::Closed) => return Err(CliError::Disconnected),
            },

            changed = connection.changed() => {
                if changed.is_err() {
                    return Err(CliError::Disconnected);
                }
                let info = connection.borrow_and_update().clone();
                printer.connection(info.state, info.reconnect_attempt);
                if info.state == ConnectionState::Disconnected {
                    return Err(CliError::Disconnected);
                }
            }
        }
    }
}

fn wanted(only: Option<&DeviceId>, id: &DeviceId) -> bool {
    only.is_none_or(|o| o == id)
}

struct Printer<'a> {
    session: &'a Session,
    global: &'a GlobalOpts,
    color: bool,
}

impl Printer<'_> {
    /// Print every device whose record was replaced, plus the ones that
    /// vanished.
    fn diff(&self, previous: &DeviceMap, current: &DeviceMap, only: Option<&DeviceId>) {
        for (id, state) in current.iter() {
            let unchanged = previous.get(id).is_some_and(|old| Arc::ptr_eq(old, state));
            if !unchanged && wanted(only, id) {
                self.device(Arc::clone(state));
            }
        }
        for id in previous.keys() {
            if !current.contains_key(id) && wanted(only, id) {
                self.line(&format!("{} {id} gone", stamp()));
            }
        }
    }

    fn device(&self, state: Arc<DeviceState>) {
        let view = DeviceView::build(self.session, state);
        let out = output::render_stream_item(&self.global.output, &view, |v| {
            let d = &v.state;
            format!(
                "{} {} {} speed={}% dir={} sync={}{}",
                stamp(),
                d.id,
                d.execution_state,
                d.speed_percent,
                d.direction,
                output::sync_label(v.sync_status, self.color),
                d.last_error
                    .as_deref()
                    .map_or_else(String::new, |e| format!(" error=\"{e}\"")),
            )
        });
        output::print_output(&out, self.global.quiet);
    }

    fn event(&self, event: &Event) {
        let out = output::render_stream_item(&self.global.output, event, |e| {
            let what = match &e.kind {
                EventKind::Playback { event_type } => event_type.clone(),
                EventKind::Added => "added".into(),
                EventKind::Removed => "removed".into(),
            };
            format!("{} {} event={what}", e.timestamp.to_rfc3339(), e.device_id)
        });
        output::print_output(&out, self.global.quiet);
    }

    fn connection(&self, state: ConnectionState, attempt: u32) {
        if self.global.quiet {
            return;
        }
        let label = if attempt > 0 && state == ConnectionState::Connecting {
            format!("{state} (attempt {attempt})")
        } else {
            state.to_string()
        };
        if self.color {
            eprintln!("{} connection {}", stamp(), label.cyan());
        } else {
            eprintln!("{} connection {label}", stamp());
        }
    }

    fn line(&self, text: &str) {
        output::print_output(text, self.global.quiet);
    }
}

fn stamp() -> String {
    Utc::now().format("%H:%M:%S%.3f").to_string()
}
