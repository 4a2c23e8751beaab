use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use conductor::cleanup::CleanupReport;
use conductor::config::Config;
use conductor::orchestration::RunRequest;
use conductor::run::RunOutcome;
use conductor::spawner::CommandSpawner;
use conductor::store::{EntityStore, MemoryStore, StoreSnapshot};
use conductor::{Conductor, Result};

/// Conductor - dependency-aware orchestration for fleets of coding agents
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG            Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Plan an objective into tasks and drive agents through them
    Run {
        /// What the agents should accomplish
        objective: String,

        /// Working scope shared by the run's agents (default: current directory)
        #[arg(long)]
        scope: Option<String>,

        /// Short title for the run
        #[arg(long)]
        title: Option<String>,

        /// Give up after this many minutes
        #[arg(long)]
        max_minutes: Option<u64>,

        /// Worker session to resume
        #[arg(long)]
        resume: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reclaim stale agents and idle channels
    Cleanup {
        /// Actually terminate and close (default: just report)
        #[arg(long)]
        delete: bool,

        /// Override the stale-agent threshold
        #[arg(long)]
        stale_minutes: Option<u64>,

        /// Override the idle-channel threshold
        #[arg(long)]
        room_minutes: Option<u64>,
    },

    /// Print the effective configuration
    Config,

    /// Summarize tasks and agents in the saved state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);
    debug!(command = ?cli.command, "conductor starting");

    let mut config = Config::load()?;
    match cli.command {
        Command::Run {
            objective,
            scope,
            title,
            max_minutes,
            resume,
            json,
        } => {
            if let Some(minutes) = max_minutes {
                config.engine.max_run_minutes = minutes;
            }
            let scope = match scope {
                Some(scope) => scope,
                None => std::env::current_dir()?.display().to_string(),
            };
            let mut request = RunRequest::new(&objective, &scope);
            request.title = title;
            request.resume_session = resume;
            run_objective(config, request, json).await
        }
        Command::Cleanup {
            delete,
            stale_minutes,
            room_minutes,
        } => {
            if let Some(minutes) = stale_minutes {
                config.cleanup.agent_stale_minutes = minutes;
            }
            if let Some(minutes) = room_minutes {
                config.cleanup.room_inactive_minutes = minutes;
            }
            run_cleanup(config, delete).await
        }
        Command::Config => run_config(&config),
        Command::Status => run_status().await,
    }
}

async fn load_store() -> Result<(PathBuf, Arc<MemoryStore>)> {
    Config::ensure_dirs()?;
    let path = Config::state_path()?;
    let store = MemoryStore::load(&path).await?;
    Ok((path, Arc::new(store)))
}

fn build(config: Config, store: &Arc<MemoryStore>) -> Conductor {
    let shared: Arc<dyn EntityStore> = store.clone();
    Conductor::builder(config).store(shared).build()
}

async fn run_objective(config: Config, request: RunRequest, json: bool) -> Result<()> {
    let spawner = CommandSpawner::from_config(&config);
    if !spawner.is_available() {
        warn!(binary = spawner.binary(), "agent command not found on PATH");
        eprintln!(
            "warning: '{}' not found on PATH; agents will fail to start",
            spawner.binary()
        );
    }

    let (path, store) = load_store().await?;
    let conductor = build(config, &store);
    let mut handle = conductor.start_run(request)?;
    info!(run = %handle.run_id, "run submitted");
    if !json {
        println!("Run {}", handle.run_id.short());
    }

    while let Some(update) = handle.progress.recv().await {
        if !json {
            let phase = update.phase.map(|p| p.to_string()).unwrap_or_default();
            println!("  [{:>3}%] {:<10} {}", update.percent, phase, update.message);
        }
    }
    let outcome = handle.wait().await;

    conductor.shutdown().await;
    store.save(&path).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    println!();
    println!("{}", if outcome.success { "Run succeeded" } else { "Run failed" });
    println!("  {}", outcome.message);
    println!();
    for task in &outcome.data.tasks {
        let agent = task.agent_id.map(|a| a.short()).unwrap_or_else(|| "-".into());
        println!("  {:<12} {:<10} {}", task.status.to_string(), agent, task.title);
    }
    if !outcome.data.failures.is_empty() {
        println!();
        println!("Failures:");
        for failure in &outcome.data.failures {
            println!("  • {}", failure);
        }
    }
    println!();
    println!(
        "Duration: {:.1}s",
        Duration::from_millis(outcome.data.duration_ms).as_secs_f64()
    );
}

async fn run_cleanup(config: Config, delete: bool) -> Result<()> {
    debug!(delete, "cleanup command");
    let (path, store) = load_store().await?;
    let conductor = build(config, &store);

    let thresholds = conductor.cleanup_thresholds();
    println!(
        "Thresholds: agents stale after {} min, channels idle after {} min",
        thresholds.agent_stale_minutes, thresholds.room_inactive_minutes
    );
    let report = conductor.sweep(!delete).await;
    print_cleanup(&report);

    if delete {
        store.save(&path).await?;
    } else if report.candidate_count() > 0 {
        println!("Run with --delete to reclaim these.");
    }
    report.into_result().map(|_| ())
}

fn print_cleanup(report: &CleanupReport) {
    println!();
    println!("Stale agents: {}", report.stale_agents.len());
    for id in &report.stale_agents {
        let marker = if report.terminated_agents.contains(id) { "terminated" } else { "found" };
        println!("  • {} ({})", id.short(), marker);
    }
    println!("Inactive channels: {}", report.inactive_channels.len());
    for name in &report.inactive_channels {
        let marker = if report.closed_channels.contains(name) { "closed" } else { "found" };
        println!("  • {} ({})", name, marker);
    }
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.target, failure.message);
    }
}

fn run_config(config: &Config) -> Result<()> {
    if let Ok(path) = Config::config_path() {
        println!("# {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn run_status() -> Result<()> {
    let (_, store) = load_store().await?;
    let snapshot: StoreSnapshot = store.snapshot().await;

    let mut tasks: BTreeMap<String, usize> = BTreeMap::new();
    for task in &snapshot.tasks {
        *tasks.entry(task.status.to_string()).or_default() += 1;
    }
    let mut agents: BTreeMap<String, usize> = BTreeMap::new();
    for agent in &snapshot.agents {
        *agents.entry(agent.status.to_string()).or_default() += 1;
    }

    println!("Tasks: {}", snapshot.tasks.len());
    for (status, count) in &tasks {
        println!("  {:<12} {}", status, count);
    }
    println!("Agents: {}", snapshot.agents.len());
    for (status, count) in &agents {
        println!("  {:<12} {}", status, count);
    }

    let running: Vec<_> = snapshot.agents.iter().filter(|a| !a.is_terminal()).collect();
    if !running.is_empty() {
        println!();
        println!("Running agents:");
        for agent in running {
            println!(
                "  {} {:<12} {:<10} last heartbeat {}",
                agent.id.short(),
                agent.role,
                agent.status.to_string(),
                agent.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}
