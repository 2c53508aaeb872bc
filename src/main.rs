use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sopflow_core::approval::ApprovalDecision;
use sopflow_core::config::AppConfig;
use sopflow_core::event::EventBus;
use sopflow_core::sop::Sop;
use sopflow_core::state::RunReport;
use sopflow_core::types::{RunId, RunStatus};

use sopflow_engine::{Engine, EngineSettings, RunLogger, RunManager, SqliteSnapshotStore};
use sopflow_tools::{HttpReasoner, ToolAdapter, ToolRegistry};

#[derive(Parser)]
#[command(name = "sopflow", version, about = "Resumable SOP execution with human approval")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sopflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and run an SOP until it finishes or pauses for approval
    Run {
        /// SOP JSON file
        sop: PathBuf,
    },
    /// Approve the pending step of a paused run and continue it
    Approve {
        run_id: String,
        step_id: String,
        /// Recorded as the decider
        #[arg(long, env = "USER", default_value = "cli")]
        by: String,
    },
    /// Reject the pending step of a paused run
    Reject {
        run_id: String,
        step_id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, env = "USER", default_value = "cli")]
        by: String,
    },
    /// Permanently stop a run
    Terminate { run_id: String },
    /// Show the stored report of a run
    Status { run_id: String },
    /// List runs, newest first
    Runs {
        /// Filter by status (pending, running, paused, succeeded, failed, terminated)
        #[arg(long)]
        status: Option<RunStatus>,
    },
    /// List runs waiting for approval
    Pending,
    /// Reject approvals older than `approval.timeout_secs`
    Expire,
    /// Continue runs interrupted by a crash
    Recover,
    /// Print the tool catalog
    Tools,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sopflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "No config file, using defaults");
    }

    let registry = Arc::new(build_registry(&config));

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::Tools => {
            print!("{}", registry.catalog());
            return Ok(());
        }
        _ => {}
    }

    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)?;

    let store = Arc::new(SqliteSnapshotStore::open(&config.store_path())?);
    let event_bus = Arc::new(EventBus::default());
    let adapter = Arc::new(ToolAdapter::new(
        registry,
        config.engine.default_tool_timeout_secs,
    ));
    let engine = Arc::new(Engine::new(
        adapter,
        store,
        event_bus.clone(),
        EngineSettings::from_config(&config),
    ));
    let manager = Arc::new(RunManager::new(engine));
    let logging = config
        .log_dir()
        .map(|dir| (dir, config.log.as_ref().map_or(2, |l| l.level)));

    match cli.command {
        Commands::Run { sop } => {
            let sop = load_sop(&sop)?;
            let rx = event_bus.subscribe();
            let (run_id, handle) = manager.spawn(sop)?;
            info!(run_id = %run_id, "Run started");
            let logger = spawn_logger(&logging, rx, &run_id);

            let ctrl_c_manager = manager.clone();
            let ctrl_c_id = run_id.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                warn!(run_id = %ctrl_c_id, "Interrupted, terminating run");
                ctrl_c_manager.terminate(&ctrl_c_id).ok();
            });

            let report = handle.await??;
            finish_logger(logger).await;
            print_report(&report)?;
        }
        Commands::Approve { run_id, step_id, by } => {
            let decision = ApprovalDecision::approved(step_id, by);
            decide(&manager, &event_bus, &logging, &run_id, decision).await?;
        }
        Commands::Reject {
            run_id,
            step_id,
            reason,
            by,
        } => {
            let reason = reason.unwrap_or_else(|| "rejected from the command line".to_string());
            let decision = ApprovalDecision::rejected(step_id, by, reason);
            decide(&manager, &event_bus, &logging, &run_id, decision).await?;
        }
        Commands::Terminate { run_id } => {
            match manager.terminate(&RunId::from_str(&run_id))? {
                Some(report) => print_report(&report)?,
                None => println!("Run {} cancelled", run_id),
            }
        }
        Commands::Status { run_id } => {
            print_report(&manager.status(&RunId::from_str(&run_id))?)?;
        }
        Commands::Runs { status } => {
            for state in manager.runs(status)? {
                println!(
                    "{}  {:<20} {:<12} {}",
                    state.run_id,
                    state.status.as_str(),
                    state.cursor.as_deref().unwrap_or("-"),
                    state.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Pending => {
            let pending = manager.pending_approvals()?;
            if pending.is_empty() {
                println!("No runs waiting for approval.");
            }
            for request in pending {
                println!("{}  {}", request.run_id, request.summary());
            }
        }
        Commands::Expire => {
            let reports = manager.expire_approvals(chrono::Utc::now()).await?;
            println!("Expired {} approval(s).", reports.len());
            for report in reports {
                println!("{}  {}", report.run_id, report.status);
            }
        }
        Commands::Recover => {
            let reports = manager.recover_all().await?;
            println!("Recovered {} run(s).", reports.len());
            for report in reports {
                println!("{}  {}", report.run_id, report.status);
            }
        }
        Commands::Tools | Commands::Config => {}
    }

    Ok(())
}

/// Built-in tools plus one reasoner per `[[reasoners]]` entry.
fn build_registry(config: &AppConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::with_builtins();
    for reasoner in &config.reasoners {
        info!(name = %reasoner.name, model = %reasoner.model, "Registering reasoner");
        registry.register_reasoner(HttpReasoner::new(reasoner.clone()));
    }
    registry
}

fn load_sop(path: &Path) -> anyhow::Result<Sop> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    Ok(Sop::from_json(&json)?)
}

async fn decide(
    manager: &RunManager,
    event_bus: &EventBus,
    logging: &Option<(PathBuf, u8)>,
    run_id: &str,
    decision: ApprovalDecision,
) -> anyhow::Result<()> {
    let run_id = RunId::from_str(run_id);
    let logger = spawn_logger(logging, event_bus.subscribe(), &run_id);
    let result = manager.decide(&run_id, decision).await;
    finish_logger(logger).await;
    print_report(&result?)?;
    Ok(())
}

struct LoggerHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_logger(
    logging: &Option<(PathBuf, u8)>,
    rx: tokio::sync::broadcast::Receiver<sopflow_core::types::RunEvent>,
    run_id: &RunId,
) -> Option<LoggerHandle> {
    let (dir, level) = logging.as_ref()?;
    let cancel = CancellationToken::new();
    let logger = RunLogger::new(dir.clone(), *level);
    let task = tokio::spawn(logger.run(rx, run_id.clone(), cancel.clone()));
    Some(LoggerHandle { cancel, task })
}

/// Let the logger drain what the run published, then stop it.
async fn finish_logger(handle: Option<LoggerHandle>) {
    let Some(handle) = handle else { return };
    let LoggerHandle { cancel, mut task } = handle;
    tokio::select! {
        _ = &mut task => {}
        _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
            cancel.cancel();
            task.await.ok();
        }
    }
}

fn print_report(report: &RunReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    if let Some(request) = &report.pending_approval {
        eprintln!(
            "\nRun {} is waiting for approval: {}\n  sopflow approve {} {}",
            report.run_id,
            request.summary(),
            report.run_id,
            request.step_id
        );
    }
    Ok(())
}
