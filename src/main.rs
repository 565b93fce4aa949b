use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dripflow::automation::{parse_automation_file, ListStatus};
use dripflow::config::Config;
use dripflow::engine::Engine;
use dripflow::lifecycle::LifecycleController;
use dripflow::nodes::{ExecutorRegistry, Services};
use dripflow::shutdown::ShutdownCoordinator;
use dripflow::storage::{RunStatus, SqliteStorage, TimelineEvent};
use dripflow::triggers::{Scheduler, TriggerMatcher};

#[derive(Parser)]
#[command(name = "dripflow")]
#[command(about = "Trigger-driven marketing automation engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Print results and errors as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage automations
    Automations {
        #[command(subcommand)]
        action: AutomationActions,
    },
    /// Feed activity events to the trigger matcher
    Events {
        #[command(subcommand)]
        action: EventActions,
    },
    /// Inspect runs
    Runs {
        #[command(subcommand)]
        action: RunActions,
    },
    /// Manage contact lists
    Lists {
        #[command(subcommand)]
        action: ListActions,
    },
    /// Run the scheduler until SIGINT/SIGTERM
    Worker {
        /// Serve Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Run a single scheduler pass
    Tick,
    /// List the node types automations can use
    Nodes,
    /// Database maintenance and checks
    Db {
        #[command(subcommand)]
        action: DbActions,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum AutomationActions {
    /// Create a draft automation from a YAML or JSON file
    Create {
        file: String,
        #[arg(short, long)]
        workspace: String,
    },
    /// List automations of a workspace
    List {
        #[arg(short, long)]
        workspace: String,
    },
    /// Show an automation with its stats
    Show { id: String },
    /// Make an automation live
    Activate { id: String },
    /// Stop scheduling an automation
    Pause { id: String },
    /// Soft-delete an automation and exit its active runs
    Delete { id: String },
    /// List runs of an automation
    Runs {
        id: String,
        /// Only runs with this status (active, completed, exited, failed)
        #[arg(short, long)]
        status: Option<RunStatus>,
    },
}

#[derive(Subcommand)]
enum EventActions {
    /// Record an activity event and enroll matching automations
    Emit {
        #[arg(short, long)]
        workspace: String,
        #[arg(short, long)]
        email: String,
        /// Event kind, e.g. list.subscribed or custom_event
        #[arg(short, long)]
        kind: String,
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        entity_id: Option<String>,
        /// Changed attributes as a JSON object
        #[arg(long)]
        changes: Option<String>,
    },
}

#[derive(Subcommand)]
enum RunActions {
    /// Show a run and its node executions
    History { run_id: String },
    /// Show the timeline of a contact
    Timeline {
        #[arg(short, long)]
        workspace: String,
        #[arg(short, long)]
        email: String,
    },
    /// List every run of a contact in a workspace
    Contact {
        #[arg(short, long)]
        workspace: String,
        #[arg(short, long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum ListActions {
    /// Create a contact list
    Create {
        #[arg(short, long)]
        workspace: String,
        #[arg(short, long)]
        list: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Set a contact's membership status
    Set {
        #[arg(short, long)]
        workspace: String,
        #[arg(short, long)]
        list: String,
        #[arg(short, long)]
        email: String,
        /// active, pending, unsubscribed, bounced or complained
        #[arg(short, long)]
        status: ListStatus,
    },
}

#[derive(Subcommand)]
enum DbActions {
    /// Run integrity and configuration checks
    Check,
}

/// Shell completion variants
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompletionShell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dripflow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let json = cli.json;

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) if json => {
            let envelope = match e.downcast_ref::<dripflow::Error>() {
                Some(err) => err.to_json(),
                None => serde_json::json!({
                    "success": false,
                    "error": {"code": "INTERNAL_ERROR", "message": e.to_string()}
                }),
            };
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            std::process::exit(1);
        }
        Err(e) => Err(e),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Automations { action } => match action {
            AutomationActions::Create { file, workspace } => {
                cmd_automations_create(&out, &file, &workspace).await?
            }
            AutomationActions::List { workspace } => {
                cmd_automations_list(&out, &workspace).await?
            }
            AutomationActions::Show { id } => cmd_automations_show(&out, &id).await?,
            AutomationActions::Activate { id } => cmd_automations_activate(&out, &id).await?,
            AutomationActions::Pause { id } => cmd_automations_pause(&out, &id).await?,
            AutomationActions::Delete { id } => cmd_automations_delete(&out, &id).await?,
            AutomationActions::Runs { id, status } => {
                cmd_automations_runs(&out, &id, status).await?
            }
        },
        Commands::Events { action } => match action {
            EventActions::Emit {
                workspace,
                email,
                kind,
                entity_type,
                entity_id,
                changes,
            } => {
                cmd_events_emit(
                    &out,
                    &workspace,
                    &email,
                    &kind,
                    entity_type.as_deref(),
                    entity_id.as_deref(),
                    changes.as_deref(),
                )
                .await?
            }
        },
        Commands::Runs { action } => match action {
            RunActions::History { run_id } => cmd_runs_history(&out, &run_id).await?,
            RunActions::Timeline { workspace, email } => {
                cmd_runs_timeline(&out, &workspace, &email).await?
            }
            RunActions::Contact { workspace, email } => {
                cmd_runs_contact(&out, &workspace, &email).await?
            }
        },
        Commands::Lists { action } => match action {
            ListActions::Create {
                workspace,
                list,
                name,
            } => cmd_lists_create(&out, &workspace, &list, name.as_deref()).await?,
            ListActions::Set {
                workspace,
                list,
                email,
                status,
            } => cmd_lists_set(&out, &workspace, &list, &email, status).await?,
        },
        Commands::Worker { metrics_port } => cmd_worker(metrics_port).await?,
        Commands::Tick => cmd_tick(&out).await?,
        Commands::Nodes => cmd_nodes(&out)?,
        Commands::Db { action } => match action {
            DbActions::Check => cmd_db_check(&out).await?,
        },
        Commands::Completions { shell } => cmd_completions(shell)?,
    }

    Ok(())
}

fn cmd_completions(shell: CompletionShell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let shell: Shell = shell.into();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}

/// Prints either a JSON document or the human rendering.
struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

// ============================================================================
// Automation Commands
// ============================================================================

async fn cmd_automations_create(out: &Output, file: &str, workspace: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let definition = parse_automation_file(path)?;
    let lifecycle = LifecycleController::new(get_storage()?);
    let automation = lifecycle.create(workspace, definition).await?;

    out.emit(&automation, || {
        println!("✓ Automation '{}' created as draft", automation.name);
        println!();
        println!("  ID:    {}", automation.id);
        println!("  Nodes: {}", automation.nodes.len());
        println!();
        println!("Go live with: dripflow automations activate {}", automation.id);
    })
}

async fn cmd_automations_list(out: &Output, workspace: &str) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let automations = lifecycle.list(workspace).await?;

    out.emit(&automations, || {
        if automations.is_empty() {
            println!("No automations found.");
            println!();
            println!("Create one with: dripflow automations create <file.yaml> --workspace {}", workspace);
            return;
        }

        println!(
            "{:<38} {:<24} {:<8} {:>8} {:>9} {:>6} {:>6}",
            "ID", "NAME", "STATUS", "ENROLLED", "COMPLETED", "EXITED", "FAILED"
        );
        println!("{}", "-".repeat(105));
        for a in &automations {
            println!(
                "{:<38} {:<24} {:<8} {:>8} {:>9} {:>6} {:>6}",
                a.id,
                truncate(&a.name, 24),
                a.status.to_string(),
                a.stats.enrolled,
                a.stats.completed,
                a.stats.exited,
                a.stats.failed
            );
        }
    })
}

async fn cmd_automations_show(out: &Output, id: &str) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let automation = lifecycle.get(id).await?;

    out.emit(&automation, || {
        println!("Automation: {}", automation.name);
        println!("ID:         {}", automation.id);
        println!("Workspace:  {}", automation.workspace_id);
        println!("Status:     {}", automation.status);
        println!(
            "Trigger:    {} ({:?})",
            automation.trigger.event_kind, automation.trigger.frequency
        );
        println!("Created:    {}", automation.created_at.format("%Y-%m-%d %H:%M"));
        println!();
        println!("Nodes:");
        for node in automation.nodes.iter() {
            let marker = if node.id == automation.root_node_id { "*" } else { " " };
            let successors = node.successors().join(", ");
            println!(
                "  {} {:<20} {:<20} -> {}",
                marker,
                node.id,
                node.node_type().to_string(),
                successors
            );
        }
        println!();
        let s = automation.stats;
        println!(
            "Stats: enrolled={} completed={} exited={} failed={}",
            s.enrolled, s.completed, s.exited, s.failed
        );
    })
}

async fn cmd_automations_activate(out: &Output, id: &str) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let automation = lifecycle.activate(id).await?;
    out.emit(&automation, || {
        println!("✓ Automation '{}' is live", automation.name)
    })
}

async fn cmd_automations_pause(out: &Output, id: &str) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let automation = lifecycle.pause(id).await?;
    out.emit(&automation, || {
        println!("✓ Automation '{}' paused", automation.name)
    })
}

async fn cmd_automations_delete(out: &Output, id: &str) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let exited = lifecycle.delete(id).await?;
    let result = serde_json::json!({"deleted": id, "exited_runs": exited.len()});
    out.emit(&result, || {
        println!("✓ Automation deleted ({} active runs exited)", exited.len())
    })
}

async fn cmd_automations_runs(
    out: &Output,
    id: &str,
    status: Option<RunStatus>,
) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let runs = lifecycle.list_runs(id, status).await?;

    out.emit(&runs, || {
        if runs.is_empty() {
            println!("No runs found.");
            return;
        }
        println!(
            "{:<38} {:<28} {:<10} {:<16} {:<20}",
            "RUN", "CONTACT", "STATUS", "NODE", "SCHEDULED"
        );
        println!("{}", "-".repeat(114));
        for run in &runs {
            println!(
                "{:<38} {:<28} {:<10} {:<16} {:<20}",
                run.id,
                truncate(&run.contact_email, 28),
                run.status.to_string(),
                run.current_node_id.as_deref().unwrap_or("-"),
                run.scheduled_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into())
            );
        }
    })
}

// ============================================================================
// Event Commands
// ============================================================================

async fn cmd_events_emit(
    out: &Output,
    workspace: &str,
    email: &str,
    kind: &str,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
    changes: Option<&str>,
) -> anyhow::Result<()> {
    let mut event = TimelineEvent::new(workspace, email, kind);
    if let Some(entity_id) = entity_id {
        event = event.with_entity(entity_type.unwrap_or("entity"), entity_id);
    }
    if let Some(changes) = changes {
        let changes: serde_json::Value = serde_json::from_str(changes)
            .map_err(|e| anyhow::anyhow!("--changes must be a JSON object: {}", e))?;
        event = event.with_changes(changes);
    }

    let config = Config::load();
    let engine = Arc::new(build_engine(&config)?);
    let runs = TriggerMatcher::new(engine).ingest(&event).await?;

    out.emit(&runs, || {
        println!("✓ Event {} recorded", event.id);
        if runs.is_empty() {
            println!("  No automation enrolled {}", email);
        }
        for run in &runs {
            println!(
                "  Enrolled in {} (run {}, {})",
                run.automation_id, run.id, run.status
            );
        }
    })
}

// ============================================================================
// Run Commands
// ============================================================================

async fn cmd_runs_history(out: &Output, run_id: &str) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let trace = lifecycle.run_history(run_id).await?;

    out.emit(&trace, || {
        let run = &trace.run;
        println!("Run:        {}", run.id);
        println!("Automation: {}", run.automation_id);
        println!("Contact:    {}", run.contact_email);
        println!("Status:     {}", run.status);
        if let Some(reason) = run.exit_reason {
            println!("Exit:       {}", reason);
        }
        if let Some(error) = &run.last_error {
            println!("Last error: {} (attempt {}/{})", error, run.retry_count, run.max_retries);
        }
        println!();
        println!("{:<24} {:<20} {:<20} {:<10}", "TIME", "NODE", "TYPE", "ACTION");
        println!("{}", "-".repeat(76));
        for node in &trace.nodes {
            println!(
                "{:<24} {:<20} {:<20} {:<10}",
                node.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                node.node_id,
                node.node_type,
                node.action.to_string()
            );
        }
    })
}

async fn cmd_runs_timeline(out: &Output, workspace: &str, email: &str) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let events = lifecycle.list_timeline(workspace, email).await?;

    out.emit(&events, || {
        for event in &events {
            println!(
                "{}  {:<20} {}",
                event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
                event.kind,
                event.changes
            );
        }
    })
}

async fn cmd_runs_contact(out: &Output, workspace: &str, email: &str) -> anyhow::Result<()> {
    let lifecycle = LifecycleController::new(get_storage()?);
    let runs = lifecycle.list_contact_runs(workspace, email).await?;

    out.emit(&runs, || {
        if runs.is_empty() {
            println!("No runs for {}.", email);
            return;
        }
        println!(
            "{:<38} {:<38} {:<10} {:<16} {:<20}",
            "RUN", "AUTOMATION", "STATUS", "NODE", "ENTERED"
        );
        println!("{}", "-".repeat(124));
        for run in &runs {
            println!(
                "{:<38} {:<38} {:<10} {:<16} {:<20}",
                run.id,
                run.automation_id,
                run.status.to_string(),
                run.current_node_id.as_deref().unwrap_or("-"),
                run.entered_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    })
}

// ============================================================================
// List Commands
// ============================================================================

async fn cmd_lists_create(
    out: &Output,
    workspace: &str,
    list: &str,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let storage = get_storage()?;
    storage
        .create_list(workspace, list, name.unwrap_or(list))
        .await?;
    let result = serde_json::json!({"workspace_id": workspace, "list_id": list});
    out.emit(&result, || println!("✓ List '{}' created", list))
}

async fn cmd_lists_set(
    out: &Output,
    workspace: &str,
    list: &str,
    email: &str,
    status: ListStatus,
) -> anyhow::Result<()> {
    let storage = get_storage()?;
    storage.set_membership(workspace, list, email, status).await?;
    let result = serde_json::json!({
        "workspace_id": workspace,
        "list_id": list,
        "email": email,
        "status": status,
    });
    out.emit(&result, || println!("✓ {} is {} on '{}'", email, status, list))
}

// ============================================================================
// Scheduler Commands
// ============================================================================

async fn cmd_worker(metrics_port: Option<u16>) -> anyhow::Result<()> {
    let config = Config::load();

    if let Some(port) = metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        dripflow::metrics::serve_metrics(addr)?;
        println!("Metrics on http://{}/metrics", addr);
    }

    let engine = Arc::new(build_engine(&config)?);
    let shutdown = ShutdownCoordinator::new();
    shutdown.listen_for_signals();

    println!(
        "dripflow worker {} polling every {}ms",
        engine.worker_id(),
        config.scheduler.poll_interval_ms
    );
    let mut scheduler = Scheduler::new(engine, &config.scheduler).with_shutdown(shutdown);
    scheduler.run_until_shutdown().await?;

    println!("Worker stopped");
    Ok(())
}

async fn cmd_tick(out: &Output) -> anyhow::Result<()> {
    let config = Config::load();
    let engine = Arc::new(build_engine(&config)?);
    let summary = Scheduler::new(engine, &config.scheduler).poll_once().await?;

    let result = serde_json::json!({
        "claimed": summary.claimed,
        "walked": summary.walked,
        "skipped": summary.skipped,
        "lost": summary.lost,
        "errors": summary.errors,
    });
    out.emit(&result, || {
        println!(
            "Claimed {} due runs: {} walked, {} skipped, {} lost, {} errors",
            summary.claimed, summary.walked, summary.skipped, summary.lost, summary.errors
        )
    })
}

// ============================================================================
// Node Commands
// ============================================================================

fn cmd_nodes(out: &Output) -> anyhow::Result<()> {
    let registry = ExecutorRegistry::new();
    let nodes: Vec<_> = registry
        .list()
        .into_iter()
        .map(|(node_type, description)| {
            serde_json::json!({"type": node_type, "description": description})
        })
        .collect();

    out.emit(&nodes, || {
        println!("Available node types:");
        println!();
        for (node_type, description) in registry.list() {
            println!("  {:<20} {}", node_type.to_string(), description);
        }
    })
}

// ============================================================================
// Database Commands
// ============================================================================

async fn cmd_db_check(out: &Output) -> anyhow::Result<()> {
    let storage = get_storage()?;
    let health = storage.check_health().await?;

    out.emit(&health, || {
        println!(
            "Foreign keys: {}",
            if health.foreign_keys_enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
        println!("Integrity check: {}", health.integrity_check);
        println!("Journal mode: {}", health.journal_mode);
        println!("Busy timeout: {}ms", health.busy_timeout_ms);
        println!("Active runs: {} ({} due)", health.active_runs, health.due_runs);
    })?;

    let healthy = health.foreign_keys_enabled && health.integrity_check.eq_ignore_ascii_case("ok");
    if healthy {
        if !out.json {
            println!("✓ Database health check passed");
        }
        Ok(())
    } else {
        anyhow::bail!("Database health check failed")
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn get_storage() -> anyhow::Result<SqliteStorage> {
    open_storage(&Config::load())
}

fn open_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStorage::open(&db_path)?)
}

fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let storage = open_storage(config)?;
    let services = Services::from_config(config, Arc::new(storage.clone()));
    Ok(Engine::new(storage, services, config))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
