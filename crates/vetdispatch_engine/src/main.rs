//! vetdispatch
//!
//! Usage:
//!     vetdispatch serve --bind 127.0.0.1:8087
//!     vetdispatch dispatch <case-id>
//!     vetdispatch deliveries --case <case-id> --status failed

use anyhow::{anyhow, Context};
use clap::Parser;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use vetdispatch_db::{DeliveryFilter, DispatchDb, RosterEntry};
use vetdispatch_engine::{
    http, Cli, Commands, DispatchEngine, LogSender, NotificationSender, RosterAction,
    RosterCandidateSource, WebhookSender,
};
use vetdispatch_ids::{CandidateId, CaseId};
use vetdispatch_logging::{init_logging, LogConfig};
use vetdispatch_protocol::{
    vetdispatch_home, DeliveryStatus, DispatchConfig, MessageKind, SenderKind,
};

const CONFIG_FILE_NAME: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig {
        app_name: "vetdispatch",
        verbose: cli.verbose,
        quiet: cli.quiet,
    })?;

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(database) = &cli.database {
        config.database_path = database.display().to_string();
    }
    if let Commands::Serve { bind: Some(bind) } = &cli.command {
        config.bind_addr = bind.clone();
    }
    config.validate().context("Invalid configuration")?;

    let db = DispatchDb::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path))?;

    let result = run(cli.command, &config, db.clone()).await;
    db.close().await;
    result
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<DispatchConfig> {
    if let Some(path) = explicit {
        return DispatchConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }

    let default_path = vetdispatch_home().join(CONFIG_FILE_NAME);
    if default_path.exists() {
        return DispatchConfig::load(&default_path)
            .with_context(|| format!("Failed to load config {}", default_path.display()));
    }
    Ok(DispatchConfig::default())
}

fn build_engine(config: &DispatchConfig, db: DispatchDb) -> anyhow::Result<DispatchEngine> {
    let sender: Arc<dyn NotificationSender> = match config.sender {
        SenderKind::Log => Arc::new(LogSender),
        SenderKind::Webhook => {
            let url = config
                .webhook_url
                .clone()
                .ok_or_else(|| anyhow!("sender = \"webhook\" requires webhook_url"))?;
            Arc::new(WebhookSender::new(url, config.send_timeout())?)
        }
    };
    let roster = Arc::new(RosterCandidateSource::new(db.clone()));
    Ok(DispatchEngine::new(
        db,
        config,
        roster.clone(),
        roster,
        sender,
    ))
}

async fn run(command: Commands, config: &DispatchConfig, db: DispatchDb) -> anyhow::Result<()> {
    match command {
        Commands::Serve { .. } => serve(config, db).await,
        Commands::Dispatch { case_id } => {
            let engine = build_engine(config, db)?;
            let case_id = parse_case_id(&case_id)?;
            let report = engine.coordinator.dispatch_case(&case_id).await?;
            println!(
                "Case {}: {} selected, {} new, {} sent, {} failed",
                case_id,
                report.selected,
                report.new_rows,
                report.broadcast.sent(),
                report.broadcast.failed()
            );
            Ok(())
        }
        Commands::Sweep => {
            let engine = build_engine(config, db)?;
            let report = engine
                .coordinator
                .sweep_expired(DispatchDb::now_millis())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Cancel { case_id } => {
            let engine = build_engine(config, db)?;
            let case_id = parse_case_id(&case_id)?;
            if engine.coordinator.cancel_case(&case_id).await? {
                println!("Case {} cancelled", case_id);
            } else {
                println!("Case {} is not open; nothing to cancel", case_id);
            }
            Ok(())
        }
        Commands::Deliveries {
            case_id,
            kind,
            status,
            recipient,
            limit,
            json,
        } => {
            let filter = DeliveryFilter {
                case_id: case_id.as_deref().map(parse_case_id).transpose()?,
                candidate_id: None,
                recipient_email: recipient,
                message_kind: kind
                    .as_deref()
                    .map(MessageKind::from_str)
                    .transpose()
                    .map_err(|e| anyhow!(e))?,
                status: status
                    .as_deref()
                    .map(DeliveryStatus::from_str)
                    .transpose()
                    .map_err(|e| anyhow!(e))?,
                limit: Some(limit),
            };
            let entries = db.list_deliveries(&filter).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("No deliveries found.");
                return Ok(());
            }
            println!(
                "{:<6} {:<24} {:<8} {:<4} {:<32} {}",
                "ID", "KIND", "STATUS", "TRY", "RECIPIENT", "DETAIL"
            );
            for entry in entries {
                println!(
                    "{:<6} {:<24} {:<8} {:<4} {:<32} {}",
                    entry.id,
                    entry.message_kind.as_str(),
                    entry.status.as_str(),
                    entry.attempts,
                    entry.recipient_email.as_deref().unwrap_or("-"),
                    entry.error_detail.as_deref().unwrap_or(""),
                );
            }
            Ok(())
        }
        Commands::Roster { action } => match action {
            RosterAction::Import { file } => {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let entries: Vec<RosterEntry> = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse roster {}", file.display()))?;
                for entry in &entries {
                    db.upsert_roster_entry(entry)
                        .await
                        .with_context(|| format!("Failed to import {}", entry.candidate_id))?;
                }
                println!("Imported {} roster entries", entries.len());
                Ok(())
            }
            RosterAction::SetAvailable {
                candidate_id,
                available,
            } => {
                let candidate_id = CandidateId::parse(&candidate_id)
                    .map_err(|e| anyhow!("Invalid candidate id: {}", e))?;
                if db.set_availability(&candidate_id, available).await? {
                    println!("{} available = {}", candidate_id, available);
                } else {
                    println!("{} is not on the roster", candidate_id);
                }
                Ok(())
            }
        },
    }
}

async fn serve(config: &DispatchConfig, db: DispatchDb) -> anyhow::Result<()> {
    let engine = build_engine(config, db)?;
    info!(
        bind = %config.bind_addr,
        database = %config.database_path,
        escalation = ?config.escalation,
        "Starting vetdispatch"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = {
        let coordinator = engine.coordinator.clone();
        tokio::spawn(async move { coordinator.run_sweeper(shutdown_rx).await })
    };

    let signal = async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating shutdown..."),
            Err(err) => error!(error = %err, "Failed to listen for Ctrl+C; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    };

    http::serve(&config.bind_addr, engine.http_state(), signal).await?;
    sweeper.await.context("Sweep task failed")?;
    engine.resolver.wait_for_announcements().await;
    info!("vetdispatch stopped");
    Ok(())
}

fn parse_case_id(value: &str) -> anyhow::Result<CaseId> {
    CaseId::parse(value).map_err(|e| anyhow!("Invalid case id '{}': {}", value, e))
}
