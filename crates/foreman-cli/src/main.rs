//! foreman - command-line entry point for the rollout operator.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use foreman::config::{load_config, load_default_config};
use foreman::{
    init_logging, Backends, OperatorConfig, Orchestrator, ResourceSpec, RolloutOutcome, Session,
    SessionOptions, Status,
};

mod cli;

use cli::{Cli, Commands, WaitArgs};

/// Exit status after an interrupt.
const INTERRUPTED: i32 = 130;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    init_logging(cli.log_format, level).context("failed to initialise logging")?;

    let config = match &cli.config {
        Some(path) => load_config(path),
        None => load_default_config(),
    }
    .context("failed to load operator config")?;

    match cli.command {
        Commands::Rollout {
            resource,
            spec,
            set,
            prune,
            wait,
        } => rollout(&config, &resource, spec.as_deref(), &set, prune, &wait),
        Commands::Uninstall { resource, wait } => uninstall(&config, &resource, &wait),
        Commands::Status { resource } => status(&config, &resource),
    }
}

fn open_session(config: &OperatorConfig, resource: &str, options: SessionOptions) -> Result<Session> {
    let session = Session::new(resource, options, Backends::from_config(config))
        .with_context(|| format!("cannot open session for {}", resource))?;

    let teardown = session.teardown_handle();
    ctrlc::set_handler(move || {
        log::warn!("interrupted, releasing locks");
        teardown.run();
        std::process::exit(INTERRUPTED);
    })
    .context("failed to install interrupt handler")?;

    Ok(session)
}

fn session_options(config: &OperatorConfig, wait: &WaitArgs) -> SessionOptions {
    SessionOptions::from_config(config)
        .with_wait(wait.wait.unwrap_or_default())
        .with_dry_run(wait.dry_run)
}

/// The spec to roll out: the file if given, else the persisted spec when
/// overrides need a base, else none.
fn rollout_spec(
    session: &Session,
    file: Option<&Path>,
    overrides: &[String],
) -> Result<Option<ResourceSpec>> {
    let mut spec = match file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read spec {}", path.display()))?;
            ResourceSpec::from_yaml(&text)
                .with_context(|| format!("cannot parse spec {}", path.display()))?
        }
        None if overrides.is_empty() => return Ok(None),
        None => session.load_spec().context("no persisted spec to apply overrides to")?,
    };
    foreman::values::apply_set_overrides(&mut spec.app, overrides)?;
    Ok(Some(spec))
}

fn rollout(
    config: &OperatorConfig,
    resource: &str,
    file: Option<&Path>,
    overrides: &[String],
    prune: bool,
    wait: &WaitArgs,
) -> Result<()> {
    let options = session_options(config, wait).with_prune(prune);
    let mut session = open_session(config, resource, options)?;
    let spec = rollout_spec(&session, file, overrides)?;

    match Orchestrator::default().rollout(&mut session, spec)? {
        RolloutOutcome::DryRun { diff } => print!("{}", diff),
        RolloutOutcome::Applied(report) => {
            log::info!(
                "applied {}, unchanged {}, removed {}{}",
                report.applied.len(),
                report.skipped.len(),
                report.removed.len(),
                if report.rotated { " (rotated)" } else { "" }
            );
            if !report.failed_removals.is_empty() {
                log::warn!("failed to remove: {}", report.failed_removals.join(", "));
            }
        }
    }
    Ok(())
}

fn uninstall(config: &OperatorConfig, resource: &str, wait: &WaitArgs) -> Result<()> {
    let mut session = open_session(config, resource, session_options(config, wait))?;
    let report = Orchestrator::default().uninstall(&mut session)?;
    if !report.dry_run {
        log::info!("deleted {} objects", report.deleted.len());
    }
    if !report.failed.is_empty() {
        anyhow::bail!("failed to delete: {}", report.failed.join(", "));
    }
    Ok(())
}

fn status(config: &OperatorConfig, resource: &str) -> Result<()> {
    let mut session = open_session(config, resource, SessionOptions::from_config(config))?;
    let status = Orchestrator::default().status(&mut session);
    println!("{}", serde_json::to_string_pretty(&status)?);
    if let Status::NotFound { error } = &status {
        log::debug!("status lookup failed: {}", error);
    }
    Ok(())
}
