//! wjm: workstation job manager.
//!
//! Every invocation is a short-lived process over the shared on-disk
//! state; there is no daemon. The hidden `_supervise` verb is the one
//! long-lived exception, spawned detached by dispatch.

mod commands;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use wjm_cli::{Cli, Command};
use wjm_core::{Config, StateDirs};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WJM_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
    .into_diagnostic()?;
    let dirs = StateDirs::from_config(&config);
    dirs.ensure().into_diagnostic()?;

    match cli.command {
        Command::SubmitNow { script, overrides } => {
            commands::submit::run(&config, &dirs, &script, overrides, false).await
        }
        Command::SubmitQueued { script, overrides } => {
            commands::submit::run(&config, &dirs, &script, overrides, true).await
        }
        Command::Kill { target } => commands::control::kill(&config, &dirs, &target).await,
        Command::Pause { id } => commands::control::pause(&dirs, id),
        Command::Resume { id } => commands::control::resume(&dirs, id),
        Command::Signal { id, signal } => commands::control::signal(&dirs, id, &signal),
        Command::Resubmit { id, immediate } => {
            commands::submit::resubmit(&config, &dirs, id, immediate).await
        }
        Command::Status => commands::monitor::status(&config, &dirs),
        Command::List {
            status,
            project,
            group,
            json,
        } => commands::monitor::list(&config, &dirs, status, project, group, json),
        Command::Info { id, json } => commands::monitor::info(&config, &dirs, id, json),
        Command::Logs {
            id,
            tail,
            head,
            follow,
            all,
        } => commands::monitor::logs(&dirs, id, tail, head, follow, all).await,
        Command::Watch { target } => commands::monitor::watch(&config, &dirs, target).await,
        Command::Drain => commands::lifecycle::drain(&config, &dirs).await,
        Command::Archive => commands::lifecycle::archive(&config, &dirs),
        Command::Clean { filter } => commands::lifecycle::clean(&config, &dirs, filter),
        Command::Doctor => commands::lifecycle::doctor(&dirs),
        Command::ValidateConfig => commands::lifecycle::validate_config(cli.config.as_deref()),
        Command::Resources { json } => commands::lifecycle::resources(&dirs, json).await,
        Command::Version => {
            println!("wjm {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Supervise { id } => {
            let code = wjm_exec::run_supervisor(&config, &dirs, id)
                .await
                .into_diagnostic()?;
            // The supervisor exits with the body's exit code.
            std::process::exit(code);
        }
    }
}
