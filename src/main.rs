//! deskbridge - Helpdesk-to-bugtracker synchronization engine
//!
//! Main entry point for the deskbridge CLI.

use clap::{Parser, Subcommand};
use deskbridge::backend::{BugTracker, PivotAdapter, RedmineAdapter, ZendeskAdapter};
use deskbridge::collab::{FsObjectStore, LogNotifier, StaticDirectory};
use deskbridge::config::{validate_config, BridgeConfig};
use deskbridge::orchestrator::{EscalationOutcome, Orchestrator};
use deskbridge::scheduler::Scheduler;
use deskbridge::store::TicketStore;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// deskbridge - Escalate helpdesk tickets to a bug tracker and sync them back
#[derive(Parser, Debug)]
#[command(name = "deskbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/deskbridge/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon until SIGTERM/SIGINT
    Run,

    /// Escalate one ticket to the configured tracker
    Escalate {
        /// Local ticket id
        ticket_id: i64,
    },

    /// Run one pull pass now and exit
    Pull,

    /// Add a comment to a ticket and mirror it to the remote issue
    Comment {
        /// Local ticket id
        ticket_id: i64,
        /// Comment text
        text: String,
        /// Author display name
        #[arg(short, long, default_value = "deskbridge")]
        author: String,
    },

    /// Push pending local attachments to the remote issue
    Push {
        /// Local ticket id
        ticket_id: i64,
    },

    /// Fetch remote state for one ticket and apply any changes
    Refresh {
        /// Local ticket id
        ticket_id: i64,
    },

    /// Apply one inbound exchange message (pivot backend only)
    Inbound {
        /// Path to a JSON message file
        file: PathBuf,
    },

    /// Show sync state for a ticket
    Status {
        /// Local ticket id
        ticket_id: i64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = deskbridge::logging::init() {
        eprintln!("Failed to initialize logging: {}", err);
        process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> deskbridge::Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(BridgeConfig::default_path);
    let config = BridgeConfig::load(&config_path)?;
    validate_config(&config)?;

    let tracker = build_tracker(&config)?;
    let store = Arc::new(Mutex::new(TicketStore::open(&config.db_path)?));
    let objects = Arc::new(FsObjectStore::new(&config.object_store_dir)?);
    let directory = Arc::new(StaticDirectory::new());
    let notifier = Arc::new(LogNotifier::new());

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        tracker.clone(),
        objects,
        directory,
        notifier,
    ));

    match cli.command {
        Commands::Run => {
            let interval = Duration::from_secs(config.poll_interval_secs);
            let scheduler = Scheduler::new(orchestrator, interval);
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            scheduler.run(rx).await;
        }
        Commands::Escalate { ticket_id } => {
            match orchestrator.escalate(ticket_id).await? {
                EscalationOutcome::Escalated(remote_id) => {
                    println!("Ticket {} escalated as {}", ticket_id, remote_id);
                }
                EscalationOutcome::Pending => {
                    println!("Ticket {} escalation sent, awaiting confirmation", ticket_id);
                }
                EscalationOutcome::Refused => {
                    println!("Ticket {} escalation refused (already escalated?)", ticket_id);
                }
                EscalationOutcome::NotFound => {
                    println!("Ticket {} not found", ticket_id);
                }
            }
        }
        Commands::Pull => {
            let stats = orchestrator.pull_cycle().await?;
            println!(
                "Pull complete: {} issue(s) seen, {} change(s) applied",
                stats.issues_seen, stats.changes
            );
        }
        Commands::Comment {
            ticket_id,
            text,
            author,
        } => {
            let comment = deskbridge::model::Comment::new(text, author, chrono::Utc::now());
            orchestrator.push_comment(ticket_id, &comment).await?;
            println!("Comment added to ticket {}", ticket_id);
        }
        Commands::Push { ticket_id } => {
            let count = orchestrator.push_attachments(ticket_id).await?;
            println!("Pushed {} attachment(s) for ticket {}", count, ticket_id);
        }
        Commands::Refresh { ticket_id } => {
            let changes = orchestrator.refresh_ticket(ticket_id).await?;
            println!(
                "Refreshed ticket {}: {} change(s) applied",
                ticket_id, changes
            );
        }
        Commands::Inbound { file } => {
            if config.backend != "pivot" {
                return Err(deskbridge::BridgeError::Config(
                    "inbound messages only apply to the pivot backend".to_string(),
                ));
            }
            let pivot_config = config.pivot.clone().ok_or_else(|| {
                deskbridge::BridgeError::Config("missing [pivot] section".to_string())
            })?;
            let adapter = PivotAdapter::new(pivot_config)?;
            let content = std::fs::read_to_string(&file)?;
            let payload: serde_json::Value = serde_json::from_str(&content)?;
            let update = adapter.parse_inbound(&payload)?;
            let changes = orchestrator
                .apply_remote_update(&update.issue, Some(&update.attachment_bytes))
                .await?;
            println!("Inbound message applied: {} change(s)", changes);
        }
        Commands::Status { ticket_id } => {
            let store = store.lock().await;
            let Some(ticket) = store.get_ticket(ticket_id)? else {
                println!("Ticket {} not found", ticket_id);
                return Ok(());
            };
            println!("Ticket #{}: {}", ticket.id, ticket.subject);
            println!("  Status:     {}", ticket.status.as_str());
            println!("  Escalation: {}", ticket.escalation_status.as_str());
            match store.get_issue_for_ticket(ticket_id, tracker.name())? {
                Some(issue) => {
                    println!("  Remote:     {} on {}", issue.remote_id, issue.backend);
                    if let Some(updated) = issue.last_remote_update {
                        println!("  Last remote update: {}", updated.to_rfc3339());
                    }
                }
                None => println!("  Remote:     not escalated"),
            }
            let history = store.history_for(ticket_id)?;
            if !history.is_empty() {
                println!("  History:");
                for entry in history {
                    println!(
                        "    {} {} {}",
                        entry.created_at.format("%Y-%m-%d %H:%M"),
                        entry.kind,
                        entry.detail
                    );
                }
            }
        }
    }

    Ok(())
}

fn build_tracker(config: &BridgeConfig) -> deskbridge::Result<Arc<dyn BugTracker>> {
    match config.backend.as_str() {
        "redmine" => {
            let section = config.redmine.clone().ok_or_else(|| {
                deskbridge::BridgeError::Config("missing [redmine] section".to_string())
            })?;
            Ok(Arc::new(RedmineAdapter::new(section)?))
        }
        "zendesk" => {
            let section = config.zendesk.clone().ok_or_else(|| {
                deskbridge::BridgeError::Config("missing [zendesk] section".to_string())
            })?;
            Ok(Arc::new(ZendeskAdapter::new(section)?))
        }
        "pivot" => {
            let section = config.pivot.clone().ok_or_else(|| {
                deskbridge::BridgeError::Config("missing [pivot] section".to_string())
            })?;
            Ok(Arc::new(PivotAdapter::new(section)?))
        }
        other => Err(deskbridge::BridgeError::Config(format!(
            "Unknown backend: {}",
            other
        ))),
    }
}
