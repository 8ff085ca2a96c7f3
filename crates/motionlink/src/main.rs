mod cli;
mod commands;
mod config;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use motionlink_core::{Session, SessionConfig};

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Config commands don't need a server connection
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global),

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "motionlink", &mut std::io::stdout());
            Ok(())
        }

        // Long-lived: keeps reconnecting until interrupted
        Command::Watch(args) => {
            let session_config = build_session_config(&cli.global)?;
            commands::watch::handle(&args, session_config, &cli.global).await
        }

        // Everything else connects, waits for the first snapshot, runs once
        cmd => {
            let session_config = build_session_config(&cli.global)?;
            let global = &cli.global;

            tracing::debug!(command = ?cmd, server = %session_config.url, "dispatching command");
            Session::oneshot(session_config, |session| async move {
                commands::dispatch(cmd, &session, global).await
            })
            .await
        }
    }
}

/// Config file + profile + flag overrides.
fn build_session_config(global: &GlobalOpts) -> Result<SessionConfig, CliError> {
    let cfg = config::load_config()?;
    config::resolve_session_config(global, &cfg)
}
