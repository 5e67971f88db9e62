//! Job executors.
//!
//! An executor runs one job with a given environment under the job's
//! permission scope and reports how it ended. Two substrates exist:
//! - `shell`: script bodies run as sandboxed subprocesses
//! - `handler`: named in-process handlers registered by the embedding program

pub mod handler;
pub mod shell;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::registry::{JobDefinition, ScriptBody};
use crate::domain::Env;

pub use handler::{HandlerExecutor, JobContext, JobHandler};
pub use shell::ShellExecutor;

/// How a job run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Exit signal ok
    Succeeded,

    /// Non-zero exit or explicit failure signal
    Failed { reason: String },

    /// Exceeded its wall-clock budget and was terminated
    TimedOut { after: Duration },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Result of one job run
#[derive(Debug, Clone)]
pub struct JobResult {
    pub outcome: JobOutcome,

    /// Declared output variables read back from the job; always empty unless
    /// the job succeeded
    pub captured_output: Env,

    /// Output lines captured while the job ran
    pub logs: Vec<String>,

    pub duration_ms: u64,
}

impl JobResult {
    /// Failed result that never reached the job
    pub fn failed(reason: impl Into<String>, logs: Vec<String>, duration_ms: u64) -> Self {
        Self {
            outcome: JobOutcome::Failed {
                reason: reason.into(),
            },
            captured_output: Env::new(),
            logs,
            duration_ms,
        }
    }
}

/// Trait for job executors
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run a job. Job failures are reported through [`JobOutcome`], never as
    /// errors, so the caller always learns how the job ended.
    async fn run(&self, definition: &JobDefinition, env: &Env, timeout: Duration) -> JobResult;
}

/// Executor that routes each job to the substrate its script names
pub struct ScriptExecutor {
    shell: ShellExecutor,
    handlers: HandlerExecutor,
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new(ShellExecutor::new(), HandlerExecutor::new())
    }
}

impl ScriptExecutor {
    pub fn new(shell: ShellExecutor, handlers: HandlerExecutor) -> Self {
        Self { shell, handlers }
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    fn name(&self) -> &str {
        "script"
    }

    async fn run(&self, definition: &JobDefinition, env: &Env, timeout: Duration) -> JobResult {
        match definition.script {
            ScriptBody::Shell(_) => self.shell.run(definition, env, timeout).await,
            ScriptBody::Handler(_) => self.handlers.run(definition, env, timeout).await,
        }
    }
}

/// Keep only the variables the job declared as output
pub fn retain_declared(definition: &JobDefinition, env: Env) -> Env {
    let declared = definition.declared_outputs();
    env.into_iter()
        .filter(|(name, _)| declared.contains(name.as_str()))
        .collect()
}

/// Log lines shared between a running job and its executor.
///
/// Lines are appended as they arrive, so whatever a job printed before it
/// failed or was killed is still available afterwards.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push(line.into());
    }

    /// Copy of all lines so far
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
