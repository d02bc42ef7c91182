//! Scholar Harvest CLI
//!
//! Operator surface over the orchestrator: track scholars, trigger or cancel
//! runs, run the tick scheduler, and manage the continuation queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use harvest_core::{HarvestConfig, PublicationId, RunStatus, TriggerKind, DEFAULT_SCOPE};
use harvest_ingest::{HarvestStore, MemoryStore};
use harvest_runtime::{Collaborators, ExecutedRun, Orchestrator, Scheduler};

#[derive(Parser)]
#[command(name = "scholar-harvest")]
#[command(author, version, about = "Scholar Harvest: rate-limited publication harvesting", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short, long, env = "HARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// State file holding scholars, runs, queue and publications
    #[arg(short, long, env = "HARVEST_STATE", default_value = "harvest-state.json")]
    state: PathBuf,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1")]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Track a scholar profile in a scope
    Track {
        /// Profile identifier of the scholar
        scholar_id: String,

        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,

        /// Display name shown in reports
        #[arg(long)]
        name: Option<String>,
    },

    /// Run one manual harvest of a scope (Ctrl-C cancels)
    Run {
        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,

        /// Idempotency key; repeating it returns the earlier run
        #[arg(long)]
        key: Option<String>,
    },

    /// Run the tick scheduler until Ctrl-C
    Daemon,

    /// Inspect or manage the continuation queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show safety, queue and last-run state of a scope
    Status {
        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },

    /// Near-duplicate publication review
    Dedup {
        #[command(subcommand)]
        action: DedupAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queue items
    List {
        /// Only items of this scope
        #[arg(long)]
        scope: Option<String>,
    },
    /// Make an item due now
    Retry { scholar_id: String },
    /// Stop resuming a scholar until it is retried
    Drop { scholar_id: String },
    /// Remove an item entirely
    Clear { scholar_id: String },
}

#[derive(Subcommand)]
enum DedupAction {
    /// List likely duplicate pairs
    Sweep,
    /// Fold a duplicate publication into its primary
    Merge { primary: String, duplicate: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let orchestrator = build_orchestrator(cli.config.as_deref(), &cli.state)?;

    match cli.command {
        Commands::Track {
            scholar_id,
            scope,
            name,
        } => {
            let scholar = orchestrator
                .track_scholar(&scholar_id, &scope, name.as_deref())
                .await?;
            println!("Tracking {} in scope '{}'", scholar.id, scholar.scope);
        }
        Commands::Run { scope, key } => {
            run_once(&orchestrator, &scope, key.as_deref()).await?;
        }
        Commands::Daemon => {
            let handle = Scheduler::new(orchestrator.clone()).start()?;
            println!("Scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            handle.stop().await;
        }
        Commands::Queue { action } => queue_command(&orchestrator, action).await?,
        Commands::Status { scope } => show_status(&orchestrator, &scope).await?,
        Commands::Dedup { action } => dedup_command(&orchestrator, action).await?,
    }

    Ok(())
}

fn build_orchestrator(config: Option<&Path>, state: &Path) -> Result<Arc<Orchestrator>> {
    let config = match config {
        Some(path) => HarvestConfig::load(path)?,
        None => HarvestConfig::default(),
    };
    let store: Arc<dyn HarvestStore> = Arc::new(
        MemoryStore::open(state)
            .with_context(|| format!("opening state file {}", state.display()))?,
    );
    let deps = Collaborators::http(&config, store)?;
    Ok(Arc::new(Orchestrator::new(config, deps)))
}

async fn run_once(orchestrator: &Arc<Orchestrator>, scope: &str, key: Option<&str>) -> Result<()> {
    let spawned = orchestrator
        .spawn_run(TriggerKind::Manual, scope, key)
        .await?;
    let run_id = spawned.started.run.id;

    let Some(mut handle) = spawned.handle else {
        println!(
            "Key already used by run {} ({})",
            run_id, spawned.started.run.status
        );
        return Ok(());
    };
    println!("Run {} started in scope '{}'", run_id, scope);

    let finished = tokio::select! {
        result = &mut handle => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let executed = match finished {
        Some(result) => result??,
        None => {
            println!("Canceling run {}...", run_id);
            orchestrator.cancel_run(run_id).await?;
            handle.await??
        }
    };

    print_run(&executed);
    if let Some(enrichment) = executed.enrichment {
        let summary = enrichment.await?;
        println!(
            "Identifiers: {} resolved, {} skipped, {} unmatched, {} failed",
            summary.resolved,
            summary.skipped(),
            summary.unmatched,
            summary.failed
        );
    }
    Ok(())
}

fn print_run(executed: &ExecutedRun) {
    let run = &executed.run;
    let counters = &run.counters;
    println!("\nRun {}: {}", run.id, run.status);
    println!(
        "   Scholars: {} total, {} complete, {} partial, {} failed",
        counters.scholars_total, counters.succeeded, counters.partial, counters.failed
    );
    println!(
        "   Pages: {} | New: {} | Merged: {}",
        counters.pages_fetched, counters.new_publications, counters.merged_publications
    );
    for report in &executed.reports {
        println!(
            "   - {} {} (cstart {})",
            report.scholar.id,
            report.outcome.as_str(),
            report.cursor.cstart
        );
    }
    if run.status == RunStatus::Failed {
        if let Some(error) = &run.error {
            println!("   Error: {}", error);
        }
    }
}

async fn queue_command(orchestrator: &Orchestrator, action: QueueAction) -> Result<()> {
    let item = match action {
        QueueAction::List { scope } => {
            let items = orchestrator.list_queue_items(scope.as_deref()).await?;
            if items.is_empty() {
                println!("Queue is empty");
            }
            for item in items {
                println!(
                    "{} [{}] {} cstart={} attempts={} next={}{}",
                    item.scholar_id,
                    item.scope,
                    item.status,
                    item.resume_cstart,
                    item.attempt_count,
                    item.next_attempt_at.to_rfc3339(),
                    item.last_error
                        .as_deref()
                        .map(|e| format!(" error={}", e))
                        .unwrap_or_default()
                );
            }
            return Ok(());
        }
        QueueAction::Retry { scholar_id } => orchestrator.retry_queue_item(&scholar_id).await?,
        QueueAction::Drop { scholar_id } => orchestrator.drop_queue_item(&scholar_id).await?,
        QueueAction::Clear { scholar_id } => orchestrator.clear_queue_item(&scholar_id).await?,
    };
    println!("{}: {}", item.scholar_id, item.status);
    Ok(())
}

async fn show_status(orchestrator: &Orchestrator, scope: &str) -> Result<()> {
    let status = orchestrator.status(scope).await?;
    println!("Scope '{}'", status.scope);
    match (status.safety.cooldown_reason, status.cooldown_remaining_secs) {
        (Some(reason), Some(remaining)) => {
            println!("   Cooldown: {} ({}s remaining)", reason, remaining)
        }
        _ => println!("   Cooldown: none"),
    }
    println!(
        "   Consecutive blocked/network runs: {}/{}",
        status.safety.consecutive_blocked_runs, status.safety.consecutive_network_runs
    );
    println!("   Queue: {} pending, {} dropped", status.queued, status.dropped);
    if let Some(run_id) = status.active_run {
        println!("   Active run: {}", run_id);
    }
    match status.last_run {
        Some(run) => println!(
            "   Last run: {} {} at {}",
            run.id,
            run.status,
            run.created_at.to_rfc3339()
        ),
        None => println!("   Last run: none"),
    }
    Ok(())
}

async fn dedup_command(orchestrator: &Orchestrator, action: DedupAction) -> Result<()> {
    match action {
        DedupAction::Sweep => {
            let pairs = orchestrator.dedup().sweep_near_duplicates().await?;
            if pairs.is_empty() {
                println!("No near-duplicates found");
            }
            for pair in pairs {
                println!("{} <- {} ({:.2})", pair.primary, pair.duplicate, pair.similarity);
            }
        }
        DedupAction::Merge { primary, duplicate } => {
            let primary: PublicationId = primary
                .parse()
                .with_context(|| format!("invalid publication id '{}'", primary))?;
            let duplicate: PublicationId = duplicate
                .parse()
                .with_context(|| format!("invalid publication id '{}'", duplicate))?;
            let merged = orchestrator
                .dedup()
                .merge_near_duplicate(primary, duplicate)
                .await?;
            println!("Merged {} into {} ({})", duplicate, merged.id, merged.title);
        }
    }
    Ok(())
}
