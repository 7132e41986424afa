//! Command-line interface for agentmesh.
//!
//! Provides commands for executing chains and single calls, inspecting
//! the event log, answering human-input requests, and checking the
//! health of both orchestrator implementations.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use crate::adapters::{AgentClient, HttpAgentClient, Notifier, RemoteOrchestrator};
use crate::config;
use crate::core::bus::EventFilter;
use crate::core::{BatchRunner, BatchTaskSpec, EventBus, Orchestrator, Registry, RouteRequest, Router};
use crate::domain::{ChainRun, RunStatus, TaskStatus};

/// agentmesh - Multi-agent chain orchestrator
#[derive(Parser, Debug)]
#[command(name = "agentmesh")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a named chain from the registry
    Run {
        /// Chain name
        chain_name: String,

        /// Input file with JSON payload (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Read input from stdin
        #[arg(long)]
        stdin: bool,
    },

    /// Call a single agent action
    Call {
        /// Agent name
        agent: String,

        /// Action name
        action: String,

        /// Call parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,
    },

    /// Check the status of a chain run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent chain runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List events from the coordination log
    Events {
        /// Filter by source agent
        #[arg(short, long)]
        source: Option<String>,

        /// Filter by action
        #[arg(short, long)]
        action: Option<String>,

        /// Maximum number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List events awaiting a human response
    Pending,

    /// Answer an event that requires human input
    Respond {
        /// Event ID (UUID)
        event_id: String,

        /// The chosen response
        response: String,

        /// Who is responding
        #[arg(short = 'u', long, default_value = "operator")]
        responder: String,
    },

    /// Acknowledge an event on behalf of an agent
    Ack {
        /// Event ID (UUID)
        event_id: String,

        /// Acknowledging agent
        agent: String,
    },

    /// Check registry drift between the two orchestrator runtimes
    Sync,

    /// Check the health of the engine, the event log, and both runtimes
    Health,

    /// Execute a batch of independent agent calls
    Batch {
        /// JSON file with an array of batch tasks
        input: PathBuf,

        /// Poll interval while waiting for completion, in seconds
        #[arg(long, default_value = "1")]
        poll_seconds: u64,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                chain_name,
                input,
                stdin,
            } => run_chain(&chain_name, input, stdin).await,
            Commands::Call {
                agent,
                action,
                params,
            } => call_agent(&agent, &action, &params).await,
            Commands::Status { run_id } => show_status(&run_id),
            Commands::Runs { limit } => list_runs(limit),
            Commands::Events {
                source,
                action,
                limit,
            } => list_events(source, action, limit),
            Commands::Pending => list_pending(),
            Commands::Respond {
                event_id,
                response,
                responder,
            } => respond(&event_id, &response, &responder),
            Commands::Ack { event_id, agent } => acknowledge(&event_id, &agent),
            Commands::Batch {
                input,
                poll_seconds,
            } => run_batch(input, poll_seconds).await,
            Commands::Sync => validate_sync().await,
            Commands::Health => check_health().await,
            Commands::Config => show_config(),
        }
    }
}

/// Shared runtime built from the resolved configuration.
struct Runtime {
    bus: Arc<EventBus>,
    orchestrator: Orchestrator,
}

fn build_runtime() -> Result<Runtime> {
    let cfg = config::config()?;

    let registry = Registry::from_file(&cfg.registry)
        .with_context(|| format!("Failed to load registry: {}", cfg.registry.display()))?;

    if let Some(parent) = cfg.events_db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }

    let notifier = Notifier::spawn(cfg.notify_endpoint.clone());
    let bus = Arc::new(
        EventBus::open(&cfg.events_db)
            .with_context(|| format!("Failed to open event log: {}", cfg.events_db.display()))?
            .with_notifier(notifier.clone()),
    );

    let client = Arc::new(HttpAgentClient::new());
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        client,
        bus.clone(),
        cfg.limits.clone(),
    )
    .with_notifier(notifier);

    Ok(Runtime { bus, orchestrator })
}

/// Build the router on top of the runtime. Requires the alternate
/// runtime's URL in the config.
fn build_router(runtime: &Runtime) -> Result<Arc<Router>> {
    let cfg = config::config()?;
    let secondary_url = cfg
        .secondary_url
        .as_ref()
        .context("router.secondary_url is not configured")?;

    let secondary = Arc::new(RemoteOrchestrator::new(secondary_url.clone()));
    Ok(Arc::new(Router::new(
        Arc::new(runtime.orchestrator.clone()),
        secondary,
        runtime.orchestrator.registry(),
        Arc::new(HttpAgentClient::new()),
        runtime.bus.clone(),
        cfg.router.clone(),
    )))
}

fn read_input(input_file: Option<PathBuf>, use_stdin: bool) -> Result<Value> {
    let raw = if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if use_stdin {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        return Ok(Value::Null);
    };

    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&raw).context("Input is not valid JSON")
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid ID: {}", raw))
}

fn print_run(run: &ChainRun) {
    println!("Run {} ({})", run.id, run.chain_name);
    println!("  status: {:?}", run.status);
    println!("  cost: ${:.4}", run.total_cost);
    for step in &run.steps {
        let note = step
            .error
            .as_deref()
            .map(|e| format!(" - {}", e))
            .unwrap_or_default();
        println!(
            "  [{:?}] {} ({}/{}) attempts={}{}",
            step.status, step.step_id, step.agent, step.action, step.attempts, note
        );
    }
}

async fn run_chain(chain_name: &str, input_file: Option<PathBuf>, use_stdin: bool) -> Result<()> {
    let input = read_input(input_file, use_stdin)?;
    let runtime = build_runtime()?;

    let run = runtime.orchestrator.execute_chain(chain_name, input).await?;
    print_run(&run);

    if run.status != RunStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

async fn call_agent(agent: &str, action: &str, params: &str) -> Result<()> {
    let params: Value = serde_json::from_str(params).context("Params are not valid JSON")?;
    let runtime = build_runtime()?;
    let request = RouteRequest::single(agent, action, params, Value::Null);

    // Route through the front door when a secondary runtime is
    // configured; otherwise call the local engine directly.
    let run = match build_router(&runtime) {
        Ok(router) => router.dispatch(request).await?,
        Err(_) => runtime.orchestrator.execute_ad_hoc(request.steps, request.input).await?,
    };

    if let Some(step) = run.steps.first() {
        if let Some(ref output) = step.output {
            println!("{}", serde_json::to_string_pretty(output)?);
        }
        if let Some(ref error) = step.error {
            eprintln!("[call failed: {}]", error);
            std::process::exit(1);
        }
    }
    Ok(())
}

fn show_status(run_id: &str) -> Result<()> {
    let run_id = parse_uuid(run_id)?;
    let runtime = build_runtime()?;

    match runtime.orchestrator.get_run(run_id) {
        Some(run) => {
            print_run(&run);
            Ok(())
        }
        None => anyhow::bail!("Run {} not found", run_id),
    }
}

fn list_runs(limit: usize) -> Result<()> {
    let runtime = build_runtime()?;
    let runs = runtime.orchestrator.list_runs(limit);

    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:24} {:?}  ${:.4}",
            run.id, run.chain_name, run.status, run.total_cost
        );
    }
    Ok(())
}

fn list_events(source: Option<String>, action: Option<String>, limit: usize) -> Result<()> {
    let runtime = build_runtime()?;
    let filter = EventFilter {
        source,
        action,
        status: None,
        limit: Some(limit),
    };

    let events = runtime.bus.list(&filter)?;
    if events.is_empty() {
        println!("No matching events");
        return Ok(());
    }
    for event in events {
        println!(
            "{}  {}  {} -> {}  [{}]",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.id,
            event.source,
            event.action,
            event.status.as_str(),
        );
    }
    Ok(())
}

fn list_pending() -> Result<()> {
    let runtime = build_runtime()?;
    let pending = runtime.bus.pending_human()?;

    if pending.is_empty() {
        println!("Nothing awaiting human input");
        return Ok(());
    }
    for item in pending {
        let event = &item.event;
        println!("{}  {}", event.id, event.question.as_deref().unwrap_or("?"));
        if !event.options.is_empty() {
            println!("  options: {}", event.options.join(", "));
        }
        if let Some(timeout_at) = item.timeout_at {
            println!("  times out at: {}", timeout_at.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(ref fallback) = event.fallback {
            println!("  fallback: {}", fallback);
        }
    }
    Ok(())
}

fn respond(event_id: &str, response: &str, responder: &str) -> Result<()> {
    let event_id = parse_uuid(event_id)?;
    let runtime = build_runtime()?;

    runtime.bus.respond(event_id, response, responder)?;
    println!("Recorded response for event {}", event_id);
    Ok(())
}

fn acknowledge(event_id: &str, agent: &str) -> Result<()> {
    let event_id = parse_uuid(event_id)?;
    let runtime = build_runtime()?;

    runtime.bus.acknowledge(event_id, agent)?;
    println!("Acknowledged event {} as {}", event_id, agent);
    Ok(())
}

async fn run_batch(input: PathBuf, poll_seconds: u64) -> Result<()> {
    let raw = std::fs::read_to_string(&input)
        .with_context(|| format!("Failed to read batch file: {}", input.display()))?;
    let tasks: Vec<BatchTaskSpec> =
        serde_json::from_str(&raw).context("Batch file is not a JSON array of tasks")?;

    let runtime = build_runtime()?;
    let runner = BatchRunner::new(runtime.orchestrator.clone());
    let batch_id = runner.execute_batch(tasks, None);
    println!("Batch {} submitted", batch_id);

    // The batch runs in the background; poll until it settles.
    loop {
        tokio::time::sleep(Duration::from_secs(poll_seconds.max(1))).await;
        let Some(batch) = runner.get_batch(batch_id) else {
            anyhow::bail!("Batch {} disappeared", batch_id);
        };
        if batch.is_complete() {
            let succeeded = batch
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Succeeded)
                .count();
            println!("Batch {} finished ({}/{} succeeded)", batch_id, succeeded, batch.tasks.len());
            for task in &batch.tasks {
                let note = task
                    .error
                    .as_deref()
                    .map(|e| format!(" - {}", e))
                    .unwrap_or_default();
                println!("  [{:?}] {}/{}{}", task.status, task.agent, task.action, note);
            }
            return Ok(());
        }
    }
}

async fn validate_sync() -> Result<()> {
    let runtime = build_runtime()?;
    let router = build_router(&runtime)?;

    let report = router.validate_sync().await;
    if report.in_sync {
        println!("Registries in sync");
    } else {
        println!("Registry drift:");
        for warning in &report.warnings {
            println!("  - {}", warning);
        }
    }
    Ok(())
}

/// Each probe is bounded so a hung runtime cannot hang the command.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

async fn check_health() -> Result<()> {
    let runtime = build_runtime()?;

    match runtime.orchestrator.health_check() {
        Ok(()) => println!("engine:    ok"),
        Err(e) => println!("engine:    failed ({})", e),
    }
    match runtime.bus.health_check() {
        Ok(()) => println!("event log: ok"),
        Err(e) => println!("event log: failed ({})", e),
    }

    let client = HttpAgentClient::new();
    let registry = runtime.orchestrator.registry();
    let mut agents: Vec<_> = registry.agents.values().collect();
    agents.sort_by(|a, b| a.name.cmp(&b.name));
    for agent in agents {
        match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, client.probe(&agent.location)).await {
            Ok(Ok(())) => println!("agent {}: ok", agent.name),
            Ok(Err(e)) => println!("agent {}: failed ({})", agent.name, e),
            Err(_) => println!("agent {}: probe timed out", agent.name),
        }
    }

    match build_router(&runtime) {
        Ok(router) => {
            if tokio::time::timeout(HEALTH_PROBE_TIMEOUT.saturating_mul(2), router.probe_once())
                .await
                .is_err()
            {
                println!("router:    probe timed out");
            }
            let report = router.health_report();
            println!("primary:   {:?}", report.primary);
            println!("secondary: {:?}", report.secondary);
            println!("routing:   {}", report.routing_to);
        }
        Err(_) => println!("router:    no secondary configured"),
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("home:       {}", cfg.home.display());
    println!("registry:   {}", cfg.registry.display());
    println!("events db:  {}", cfg.events_db.display());
    match cfg.config_file {
        Some(ref path) => println!("config:     {}", path.display()),
        None => println!("config:     (defaults)"),
    }
    println!("limits:     {:?}", cfg.limits);
    println!("router:     {:?}", cfg.router);
    match cfg.secondary_url {
        Some(ref url) => println!("secondary:  {}", url),
        None => println!("secondary:  (none)"),
    }
    Ok(())
}
