//! Command handlers

use anyhow::{Context, Result};
use serde::Serialize;
use shuttle::lock::{list_archives, prune_archives};
use shuttle::{
    Backend, ExitCode, LedgerRecord, OperationLedger, OperationReport, Orchestrator, ShareTarget, ShuttleConfig,
    ShuttleContext,
};
use tracing::info;

use crate::terminal::confirmer;
use crate::{ArchiveActions, Commands, Invocation, ServerActions};

pub async fn dispatch(command: Commands, mut config: ShuttleConfig, invocation: &Invocation) -> Result<ExitCode> {
    match command {
        Commands::Init => init(&config, invocation).await,
        Commands::Servers { action } => servers(action, &mut config, invocation).await,
        command => {
            let ctx = ShuttleContext::new(invocation.layout.root(), &config)?;
            match command {
                Commands::Status { limit } => status(&ctx, limit, invocation.json),
                Commands::Archive { action } => archive(action, &ctx, invocation.json),
                transfer => run_transfer(transfer, &ctx, invocation).await,
            }
        }
    }
}

async fn run_transfer(command: Commands, ctx: &ShuttleContext, invocation: &Invocation) -> Result<ExitCode> {
    let confirm = confirmer(invocation.assume_yes);
    let orchestrator = Orchestrator::new(ctx, Backend::from_settings(&ctx.settings), confirm.as_ref())?;

    let report = match command {
        Commands::Push { server, source, flags } => orchestrator.push(&server, &source, flags.into()).await?,
        Commands::Pull { server, dest, flags } => orchestrator.pull(&server, dest.as_deref(), flags.into()).await?,
        Commands::Relay { from, to, files, flags } => {
            let subset = (!files.is_empty()).then_some(files.as_slice());
            orchestrator.relay(&from, &to, subset, flags.into()).await?
        }
        Commands::Share { server, source, flags, .. } => {
            let target = match server {
                Some(id) => ShareTarget::Server(id),
                None => ShareTarget::Global,
            };
            orchestrator.share(&target, &source, flags.into()).await?
        }
        other => anyhow::bail!("not a transfer command: {:?}", other),
    };

    print_report(&report, invocation.json)?;
    Ok(ExitCode::Ok)
}

fn print_report(report: &OperationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let record = &report.record;
    let outcome = &report.outcome;
    let prefix = if record.dry_run { "DRY RUN: " } else { "" };
    println!(
        "{}{} {} [{}] {} -> {}",
        prefix, record.operation, record.status, record.server_id, record.source_path, record.dest_path
    );
    if record.dry_run {
        println!("  would transfer {} file(s), {} bytes", outcome.files.len(), outcome.bytes_transferred);
    } else {
        println!("  transferred {} file(s), {} bytes", outcome.files.len(), record.bytes_transferred);
    }
    for archived in &outcome.archived {
        println!("  previous version kept in {}", archived);
    }
    if outcome.vanished {
        println!("  some source files vanished during the transfer");
    }
    println!("  operation {}", record.uuid);
    Ok(())
}

async fn init(config: &ShuttleConfig, invocation: &Invocation) -> Result<ExitCode> {
    let path = &invocation.config_path;
    if tokio::fs::try_exists(path).await? {
        println!("Configuration already present at {}", path.display());
    } else {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        config
            .save(path)
            .await
            .with_context(|| format!("cannot write '{}'", path.display()))?;
        info!(path = %path.display(), "default configuration written");
        println!("Wrote default configuration to {}", path.display());
    }

    println!("Sandbox ready at {}", invocation.layout.root().display());
    println!("Next: sync-shuttle servers add <id> --host <host> --user <user> --enable");
    Ok(ExitCode::Ok)
}

fn status(ctx: &ShuttleContext, limit: usize, json: bool) -> Result<ExitCode> {
    let ledger = OperationLedger::open(ctx.layout.human_log(), ctx.layout.structured_log())?;
    let records = ledger.recent(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::Ok);
    }
    if records.is_empty() {
        println!("No operations recorded yet");
        return Ok(ExitCode::Ok);
    }
    for record in &records {
        println!("{}", status_line(record));
    }
    Ok(ExitCode::Ok)
}

fn status_line(record: &LedgerRecord) -> String {
    let mut line = format!(
        "{}  {:<5} {:<8} {:<24} {:>12} B",
        record.timestamp_start, record.operation, record.status, record.server_id, record.bytes_transferred
    );
    if record.dry_run {
        line.push_str("  (dry run)");
    }
    if !record.error_message.is_empty() {
        line.push_str("  ");
        line.push_str(&record.error_message);
    }
    line
}

async fn servers(action: ServerActions, config: &mut ShuttleConfig, invocation: &Invocation) -> Result<ExitCode> {
    match action {
        ServerActions::List => {
            let registry = config.registry();
            if invocation.json {
                let profiles: Vec<_> = registry.iter().collect();
                println!("{}", serde_json::to_string_pretty(&profiles)?);
            } else if registry.is_empty() && registry.rejected().next().is_none() {
                println!("No servers configured");
            } else {
                for profile in registry.iter() {
                    let state = if profile.enabled { "enabled" } else { "disabled" };
                    println!(
                        "{:<24} {:<32} {:<8} {}",
                        profile.id,
                        format!("{}:{}", profile.destination(), profile.port),
                        state,
                        profile.remote_root
                    );
                }
                for (id, reason) in registry.rejected() {
                    println!("{:<24} invalid: {}", id, reason);
                }
            }
            Ok(ExitCode::Ok)
        }
        ServerActions::Show { id } => {
            let registry = config.registry();
            let profile = registry.lookup(&id)?;
            if invocation.json {
                println!("{}", serde_json::to_string_pretty(profile)?);
            } else {
                print!("{}", toml::to_string_pretty(profile)?);
            }
            Ok(ExitCode::Ok)
        }
        ServerActions::Add {
            id,
            host,
            user,
            port,
            remote_base,
            identity_file,
            enable,
        } => {
            config.add_server(&id)?;
            if let Some(entry) = config.servers.get_mut(&id) {
                if let Some(host) = host {
                    entry.host = host;
                }
                if let Some(user) = user {
                    entry.user = user;
                }
                if let Some(port) = port {
                    entry.port = port;
                }
                entry.remote_base = remote_base;
                entry.identity_file = identity_file;
                entry.enabled = enable;
            }
            // refuse to write a profile that would not resolve
            config.servers[&id].to_profile(&id)?;
            save(config, invocation).await?;
            println!("Added server '{}'{}", id, if enable { "" } else { " (disabled)" });
            Ok(ExitCode::Ok)
        }
        ServerActions::Remove { id } => {
            config.remove_server(&id)?;
            save(config, invocation).await?;
            println!("Removed server '{}'", id);
            Ok(ExitCode::Ok)
        }
        ServerActions::Validate => {
            let problems = config.problems();
            if problems.is_empty() {
                println!("{} server profile(s) valid", config.servers.len());
                return Ok(ExitCode::Ok);
            }
            for problem in &problems {
                println!("✗ {}", problem);
            }
            Ok(ExitCode::Configuration)
        }
    }
}

async fn save(config: &ShuttleConfig, invocation: &Invocation) -> Result<()> {
    let path = &invocation.config_path;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    config
        .save(path)
        .await
        .with_context(|| format!("cannot write '{}'", path.display()))
}

#[derive(Serialize)]
struct PruneSummary {
    retention_days: u32,
    removed: Vec<String>,
    kept: usize,
}

fn archive(action: ArchiveActions, ctx: &ShuttleContext, json: bool) -> Result<ExitCode> {
    match action {
        ArchiveActions::List => {
            let listings = list_archives(&ctx.layout)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listings)?);
            } else if listings.is_empty() {
                println!("No archive entries");
            } else {
                for listing in &listings {
                    println!("{:<20} {:>12} B  {}", listing.stamp, listing.bytes, listing.path.display());
                }
            }
        }
        ArchiveActions::Prune { days } => {
            let retention_days = days.unwrap_or(ctx.settings.archive_retention_days);
            let report = prune_archives(&ctx.layout, retention_days, ctx.settings.lock_stale_after())?;
            let summary = PruneSummary {
                retention_days,
                removed: report.removed.iter().map(|p| p.display().to_string()).collect(),
                kept: report.kept,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for removed in &summary.removed {
                    println!("removed {}", removed);
                }
                println!(
                    "{} archive entr{} removed, {} kept (retention {} days)",
                    summary.removed.len(),
                    if summary.removed.len() == 1 { "y" } else { "ies" },
                    summary.kept,
                    retention_days
                );
            }
        }
    }
    Ok(ExitCode::Ok)
}
