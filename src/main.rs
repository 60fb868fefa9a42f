use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_core::config::EngineConfig;
use conductor_core::definition::WorkflowDefinition;
use conductor_core::event::EventBus;
use conductor_core::traits::{PersistenceSink, ReasoningBackend};
use conductor_core::types::{RunEvent, RunExecution, RunId, RunStatus};

use conductor_engine::{Engine, RunLogger, WorkflowService};
use conductor_executors::ExecutorRegistry;
use conductor_llm::LlmReasoner;
use conductor_store::{MemoryRunStore, SqliteRunStore};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Workflow stage orchestration with ReAct agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition and wait for it to finish
    Run {
        /// Definition file, or the id of a definition in `definitions_dir`
        definition: String,
        /// Initial run variable (KEY=VALUE, VALUE parsed as JSON when possible)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Recorded as the run's initiator
        #[arg(long, default_value = "cli")]
        initiator: String,
    },
    /// Validate a definition file
    Validate {
        /// Definition file (TOML or JSON)
        file: PathBuf,
    },
    /// List definitions found in `definitions_dir`
    Definitions,
    /// Show a persisted run
    Status {
        /// Run id
        run_id: String,
    },
    /// Show run history for a definition
    History {
        /// Definition id
        definition: String,
        /// Page number (1-based)
        #[arg(long, default_value = "1")]
        page: usize,
        /// Runs per page
        #[arg(long, default_value = "20")]
        page_size: usize,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conductor=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "conductor", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate_file(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Definitions => {
            let engine = build_engine(config, Arc::new(MemoryRunStore::new()), None)?;
            let mut ids = engine.definition_ids();
            ids.sort();
            if ids.is_empty() {
                println!("No definitions found.");
            }
            for id in ids {
                let def = engine.definition(&id)?;
                println!("{:<24} {:>3} stage(s)  {}", id, def.stages.len(), def.name);
            }
        }
        Commands::Status { run_id } => {
            let store = open_store(&config)?;
            match store.load_run(&RunId::from_str(&run_id)).await? {
                Some(run) => print_run(&run),
                None => anyhow::bail!("Run not found: {run_id}"),
            }
        }
        Commands::History {
            definition,
            page,
            page_size,
        } => {
            let store = open_store(&config)?;
            let engine = build_engine(config, store, None)?;
            let service = WorkflowService::new(engine);
            let runs = service.get_history(&definition, page, page_size).await?;
            if runs.is_empty() {
                println!("No runs recorded for '{definition}'.");
            }
            for run in runs {
                println!(
                    "{}  {:<10} {}  {:>8}  {}{}",
                    run.run_id,
                    run.status,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.duration_ms
                        .map(|ms| format!("{ms}ms"))
                        .unwrap_or_else(|| "-".into()),
                    run.initiated_by,
                    if run.has_errors { "  (errors)" } else { "" },
                );
            }
        }
        Commands::Run {
            definition,
            vars,
            initiator,
        } => {
            let variables = parse_vars(&vars)?;
            let sink: Arc<dyn PersistenceSink> = match config.store_path() {
                Some(_) => open_store(&config)?,
                None => Arc::new(MemoryRunStore::new()),
            };
            let reasoner = build_reasoner(&config);
            let log = config
                .log_dir()
                .map(|dir| (dir, config.log.as_ref().map(|l| l.level).unwrap_or(2)));
            let engine = build_engine(config, sink, reasoner)?;

            let definition_id = if Path::new(&definition).exists() {
                let def = WorkflowDefinition::load(Path::new(&definition))?;
                let id = def.id.clone();
                engine.register_definition(def)?;
                id
            } else {
                definition
            };

            let cancel = CancellationToken::new();
            if let Some((dir, level)) = log {
                tokio::spawn(RunLogger::new(dir, level).run(engine.event_bus().clone(), cancel.clone()));
            }
            let printer = tokio::spawn(print_events(engine.event_bus().clone(), cancel.clone()));

            let service = WorkflowService::new(engine);
            let run_id = service.start_run(&definition_id, variables, &initiator).await?;
            info!(run_id = %run_id, definition = %definition_id, "Run started");

            let run = tokio::select! {
                run = service.wait(&run_id) => run?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(run_id = %run_id, "Interrupted, cancelling run");
                    service.cancel(&run_id);
                    service.wait(&run_id).await?
                }
            };
            cancel.cancel();
            printer.await.ok();

            print_run(&run);
            if run.status != RunStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } | Commands::Validate { .. } => {
            unreachable!("handled before config load")
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        return Ok(EngineConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".conductor").join("config.toml"));
    match home_config {
        Some(p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(EngineConfig::load(&p)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn PersistenceSink>> {
    let path = config
        .store_path()
        .unwrap_or_else(|| config.workspace_dir().join("runs.db"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    Ok(Arc::new(SqliteRunStore::open(&path)?))
}

fn build_reasoner(config: &EngineConfig) -> Option<Arc<dyn ReasoningBackend>> {
    let model = config.model.clone()?;
    let client = conductor_llm::create_client(&model);
    Some(Arc::new(
        LlmReasoner::new(client, model).with_system_prompt(config.agent.system_prompt.clone()),
    ))
}

fn build_engine(
    config: EngineConfig,
    sink: Arc<dyn PersistenceSink>,
    reasoner: Option<Arc<dyn ReasoningBackend>>,
) -> anyhow::Result<Arc<Engine>> {
    let definitions_dir = config.definitions_dir();
    let mut builder = Engine::builder(config)
        .registry(ExecutorRegistry::with_builtins())
        .sink(sink)
        .event_bus(Arc::new(EventBus::default()));
    if let Some(reasoner) = reasoner {
        builder = builder.reasoner(reasoner);
    }
    let engine = builder.build();
    if let Some(dir) = definitions_dir {
        if dir.is_dir() {
            engine.load_definitions(&dir)?;
        } else {
            warn!(dir = %dir.display(), "Definitions directory does not exist");
        }
    }
    Ok(engine)
}

fn validate_file(path: &Path) -> anyhow::Result<()> {
    let def = WorkflowDefinition::load(path)?;
    match def.validate() {
        Ok(()) => {
            println!(
                "{}: ok ({} stage(s), {} phase(s))",
                def.id,
                def.stages.len(),
                def.phases().len()
            );
            Ok(())
        }
        Err(conductor_core::error::ConductorError::Validation(issues)) => {
            eprintln!("{}: {} issue(s)", def.id, issues.len());
            for issue in issues {
                eprintln!("  - {issue}");
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse `KEY=VALUE` pairs; values that are valid JSON keep their type.
fn parse_vars(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut vars = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            anyhow::bail!("Invalid variable '{pair}', expected KEY=VALUE");
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        vars.insert(key.trim().to_string(), value);
    }
    Ok(vars)
}

async fn print_events(event_bus: Arc<EventBus>, cancel: CancellationToken) {
    let mut rx = event_bus.subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            },
        };
        match event {
            RunEvent::StageStarted {
                stage_id, attempt, ..
            } => {
                if attempt > 1 {
                    eprintln!("[{stage_id}] attempt {attempt}");
                } else {
                    eprintln!("[{stage_id}] started");
                }
            }
            RunEvent::StageRetrying {
                stage_id,
                retry_count,
                error,
                ..
            } => eprintln!("[{stage_id}] retry {retry_count}: {}", truncate(&error, 200)),
            RunEvent::StageCompleted {
                stage_id,
                duration_ms,
                ..
            } => eprintln!("[{stage_id}] completed in {duration_ms}ms"),
            RunEvent::StageFailed {
                stage_id, error, ..
            } => eprintln!("[{stage_id}] FAILED: {}", truncate(&error, 200)),
            RunEvent::StageSkipped { stage_id, .. } => eprintln!("[{stage_id}] skipped"),
            RunEvent::AgentAction {
                stage_id,
                cycle,
                tool,
                success,
                ..
            } => eprintln!(
                "[{stage_id}] cycle {cycle}: {tool} {}",
                if success { "ok" } else { "error" }
            ),
            RunEvent::RunPaused { .. } => eprintln!("[run] paused"),
            RunEvent::RunResumed { .. } => eprintln!("[run] resumed"),
            _ => {}
        }
    }
}

fn print_run(run: &RunExecution) {
    println!("Run {} ({})", run.id, run.definition_id);
    println!("  status:    {}", run.status);
    if let Some(ms) = run.duration_ms() {
        println!("  duration:  {ms}ms");
    }
    println!("  cost:      {:.4}", run.total_cost);
    for step in &run.steps {
        let retries = if step.retry_count > 0 {
            format!(" ({} retr{})", step.retry_count, if step.retry_count == 1 { "y" } else { "ies" })
        } else {
            String::new()
        };
        println!("  - {:<20} {}{}", step.stage_name, step.status.as_str(), retries);
    }
    for error in &run.errors {
        println!("  error: {error}");
    }
    if !run.results.is_empty() {
        match serde_json::to_string_pretty(&run.results) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "Could not render results"),
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
