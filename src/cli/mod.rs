//! Command-line interface for tenantflow.
//!
//! Provides commands for validating job registries, dispatching lifecycle
//! events, serving an event stream, and inspecting execution records.

use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::adapters::{HandlerExecutor, ScriptExecutor, ShellExecutor};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    EventBus, ExecutionStore, LocalBus, Orchestrator, OrchestratorSettings, Registry, ScriptBody,
};
use crate::domain::{JobExecution, LifecycleEvent};

/// tenantflow - Event-driven tenant lifecycle job orchestrator
#[derive(Parser, Debug)]
#[command(name = "tenantflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load and validate a job registry
    Validate {
        /// Registry file (defaults to the configured registry)
        registry: Option<PathBuf>,
    },

    /// Publish one lifecycle event and run the jobs it triggers
    Dispatch {
        /// Event JSON file (reads stdin if omitted or "-")
        #[arg(short, long)]
        event: Option<PathBuf>,

        /// Registry file (defaults to the configured registry)
        #[arg(short, long, env = "TENANTFLOW_REGISTRY")]
        registry: Option<PathBuf>,
    },

    /// Read JSONL events from stdin and dispatch them until EOF
    Serve {
        /// Registry file (defaults to the configured registry)
        #[arg(short, long, env = "TENANTFLOW_REGISTRY")]
        registry: Option<PathBuf>,
    },

    /// List execution records
    Executions {
        /// Only show executions for this tenant
        #[arg(short, long)]
        tenant: Option<String>,

        /// Maximum number of executions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one execution, including captured logs
    Show {
        /// Execution key (`<correlation_id>:<job_id>`)
        key: String,

        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Validate { registry } => validate(registry).await,
            Commands::Dispatch { event, registry } => dispatch(event, registry).await,
            Commands::Serve { registry } => serve(registry).await,
            Commands::Executions { tenant, limit } => list_executions(tenant, limit).await,
            Commands::Show { key, json } => show_execution(&key, json).await,
            Commands::Config => show_config(),
        }
    }
}

/// Everything a dispatching command needs
struct Runtime {
    orchestrator: Orchestrator,
    bus: Arc<LocalBus>,
    registry: Arc<Registry>,
}

impl Runtime {
    async fn open(cfg: &ResolvedConfig, registry_override: Option<PathBuf>) -> Result<Self> {
        let registry_path = registry_override.unwrap_or_else(|| cfg.registry.clone());
        let registry = Arc::new(Registry::from_file(&registry_path)?);
        warn_unhandled(&registry);

        let bus = Arc::new(LocalBus::open(cfg.bus_journal_path()).await?);
        let store = Arc::new(ExecutionStore::open(cfg.executions_path()).await?);
        let executor = Arc::new(ScriptExecutor::new(
            ShellExecutor::with_shell(cfg.executor.shell.clone()),
            HandlerExecutor::new(),
        ));

        let orchestrator = Orchestrator::new(registry.clone(), bus.clone(), executor, store)
            .with_settings(OrchestratorSettings::from_config(cfg));

        Ok(Self {
            orchestrator,
            bus,
            registry,
        })
    }

    /// Subscribe a printer to every event type the registered jobs can emit
    async fn print_status_events(&self) -> Result<StatusPrinter> {
        let (sink, events) = mpsc::unbounded_channel();
        for event_type in status_event_types(&self.registry) {
            self.bus.subscribe(&event_type, sink.clone()).await?;
        }
        Ok(StatusPrinter::spawn(events))
    }
}

/// Handler jobs cannot run from the command line
fn warn_unhandled(registry: &Registry) {
    for job in registry.jobs() {
        if let ScriptBody::Handler(name) = &job.script {
            warn!(job = %job.id, handler = %name, "Handler job has no handler in the CLI and will fail");
        }
    }
}

/// Every success and failure event type the registry can produce
fn status_event_types(registry: &Registry) -> Vec<String> {
    let mut types: Vec<String> = registry
        .jobs()
        .flat_map(|job| {
            job.output_fields
                .keys()
                .cloned()
                .chain(std::iter::once(job.failure_event_type()))
        })
        .collect();
    types.sort();
    types.dedup();
    types
}

/// Prints status events as JSON lines while jobs run
struct StatusPrinter {
    done: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<usize>,
}

impl StatusPrinter {
    fn spawn(mut events: mpsc::UnboundedReceiver<LifecycleEvent>) -> Self {
        let (done, mut finished) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut printed = 0;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => printed += print_event(&event),
                        None => break,
                    },
                    _ = &mut finished => {
                        while let Ok(event) = events.try_recv() {
                            printed += print_event(&event);
                        }
                        break;
                    }
                }
            }
            printed
        });

        Self { done, task }
    }

    /// Flush anything still queued and stop; returns how many were printed
    async fn finish(self) -> usize {
        let _ = self.done.send(());
        self.task.await.unwrap_or(0)
    }
}

fn print_event(event: &LifecycleEvent) -> usize {
    match serde_json::to_string(event) {
        Ok(line) => {
            println!("{}", line);
            1
        }
        Err(e) => {
            warn!(error = %e, "Failed to serialize status event");
            0
        }
    }
}

/// Validate a registry file
async fn validate(registry: Option<PathBuf>) -> Result<()> {
    let path = match registry {
        Some(path) => path,
        None => config::registry_path()?,
    };

    let registry = Registry::from_file(&path)?;

    println!("Registry OK: {}", path.display());
    println!("Jobs: {}", registry.len());
    println!();
    println!("{:<24} {:<28} {:<10} {}", "JOB", "TRIGGER", "SCRIPT", "EMITS");
    println!("{}", "-".repeat(90));

    for job in registry.jobs() {
        let script = match &job.script {
            ScriptBody::Shell(_) => "shell".to_string(),
            ScriptBody::Handler(name) => format!("handler:{}", name),
        };
        let emits: Vec<&str> = job.output_fields.keys().map(String::as_str).collect();
        println!(
            "{:<24} {:<28} {:<10} {} | {}",
            job.id,
            job.trigger_event_type,
            script,
            emits.join(", "),
            job.failure_event_type()
        );
    }

    Ok(())
}

/// Read a single event from a file or stdin
fn read_event(path: Option<&Path>) -> Result<LifecycleEvent> {
    let content = match path {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file: {}", path.display()))?,
        _ => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read event from stdin")?;
            buffer
        }
    };

    let event: LifecycleEvent =
        serde_json::from_str(&content).context("Failed to parse lifecycle event")?;
    Ok(event.ensure_correlation_id())
}

/// Publish one event and wait until it and everything it triggers settle
async fn dispatch(event: Option<PathBuf>, registry: Option<PathBuf>) -> Result<()> {
    let event = read_event(event.as_deref())?;
    let cfg = config::config()?;
    let runtime = Runtime::open(cfg, registry).await?;

    if runtime.registry.jobs_for(&event.event_type).is_empty() {
        eprintln!("No jobs registered for '{}', nothing to run", event.event_type);
    }

    let printer = runtime.print_status_events().await?;
    let deliveries = runtime.orchestrator.subscribe_all().await?;

    info!(
        event_type = %event.event_type,
        tenant_id = %event.tenant_id,
        correlation_id = %event.correlation_id,
        "Dispatching event"
    );
    runtime.bus.publish(&event).await?;

    // Stop accepting immediately; draining handles the event and its chain
    runtime
        .orchestrator
        .serve(deliveries, std::future::ready(()))
        .await;

    let printed = printer.finish().await;
    eprintln!("Correlation ID: {} ({} status events)", event.correlation_id, printed);
    Ok(())
}

/// Dispatch JSONL events from stdin until EOF or Ctrl-C
async fn serve(registry: Option<PathBuf>) -> Result<()> {
    let cfg = config::config()?;
    let runtime = Runtime::open(cfg, registry).await?;

    let printer = runtime.print_status_events().await?;
    let deliveries = runtime.orchestrator.subscribe_all().await?;

    let reader = tokio::spawn(publish_stdin(runtime.bus.clone()));

    runtime
        .orchestrator
        .serve(deliveries, stop_signal(reader))
        .await;

    let printed = printer.finish().await;
    eprintln!("Published {} status events", printed);
    Ok(())
}

/// Resolves when stdin is exhausted or on Ctrl-C
fn stop_signal(reader: tokio::task::JoinHandle<Result<usize>>) -> impl Future<Output = ()> + Send {
    async move {
        tokio::select! {
            read = reader => match read {
                Ok(Ok(count)) => info!(events = count, "Input exhausted"),
                Ok(Err(e)) => warn!(error = %e, "Stopped reading input"),
                Err(e) => warn!(error = %e, "Input reader failed"),
            },
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    }
}

/// Publish each stdin line as a lifecycle event
async fn publish_stdin(bus: Arc<LocalBus>) -> Result<usize> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<LifecycleEvent>(line) {
            Ok(event) => event.ensure_correlation_id(),
            Err(e) => {
                warn!(error = %e, "Skipping malformed event");
                continue;
            }
        };

        bus.publish(&event).await?;
        published += 1;
    }

    Ok(published)
}

async fn open_store() -> Result<ExecutionStore> {
    let cfg = config::config()?;
    Ok(ExecutionStore::open(cfg.executions_path()).await?)
}

/// List execution records
async fn list_executions(tenant: Option<String>, limit: usize) -> Result<()> {
    let store = open_store().await?;
    let executions = match tenant {
        Some(tenant) => store.list_for_tenant(&tenant).await,
        None => store.list().await,
    };

    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!(
        "{:<50} {:<16} {:<18} {:<18} {}",
        "EXECUTION", "TENANT", "STATE", "OUTCOME", "CREATED"
    );
    println!("{}", "-".repeat(125));

    for execution in executions.into_iter().take(limit) {
        let outcome = execution
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<50} {:<16} {:<18} {:<18} {}",
            execution.id,
            execution.tenant_id,
            execution.state.to_string(),
            outcome,
            execution.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show one execution
async fn show_execution(key: &str, json: bool) -> Result<()> {
    let store = open_store().await?;
    let execution = store
        .get(key)
        .await
        .with_context(|| format!("Execution not found: {}", key))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    print_execution(&execution);
    Ok(())
}

fn print_execution(execution: &JobExecution) {
    println!("Execution: {}", execution.id);
    println!("Tenant: {}", execution.tenant_id);
    println!("Job: {} ({})", execution.job_definition_id, execution.definition_digest);
    println!("Trigger: {}", execution.trigger_event_type);
    println!("State: {}", execution.state);
    if let Some(outcome) = execution.outcome {
        println!("Outcome: {}", outcome);
    }
    println!("Created: {}", execution.created_at);
    if let Some(started) = execution.started_at {
        println!("Started: {}", started);
    }
    if let Some(finished) = execution.finished_at {
        println!("Finished: {}", finished);
    }
    if let Some(reason) = &execution.failure_reason {
        println!("Failure: {}", reason);
    }

    if !execution.captured_output.is_empty() {
        println!("\nCaptured output:");
        for (name, value) in &execution.captured_output {
            println!("  {}={}", name, value);
        }
    }

    println!(
        "\nStatus events ({} of {} published):",
        execution.announced.min(execution.status_events.len()),
        execution.status_events.len()
    );
    for event in &execution.status_events {
        println!("  {}", event.event_type);
    }

    println!("\nLogs:");
    if execution.logs.is_empty() {
        println!("  (none)");
    }
    for line in &execution.logs {
        println!("  {}", line);
    }
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("tenantflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Registry:    {}", cfg.registry.display());
    println!("  Bus journal: {}", cfg.bus_journal_path().display());
    println!("  Executions:  {}", cfg.executions_path().display());
    println!();
    println!("Executor:");
    println!("  Shell:   {}", cfg.executor.shell);
    println!("  Timeout: {}s", cfg.executor.timeout_seconds);
    println!();
    println!("Publish retry:");
    println!("  Max attempts:  {}", cfg.publish.max_attempts);
    println!("  Initial delay: {}ms", cfg.publish.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.publish.max_delay_ms);
    println!("  Multiplier:    {}", cfg.publish.backoff_multiplier);

    Ok(())
}
