//! In-process job handlers.
//!
//! The embedding program registers handlers by name; a job whose script is
//! `{ handler: <name> }` runs the matching handler with a [`JobContext`].
//! Handlers read inputs and write outputs through the context, and must call
//! [`JobContext::require`] before exercising any action.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::core::mapper::merge_env;
use crate::core::registry::{JobDefinition, ScriptBody};
use crate::core::scope::{PermissionScope, ScopeError};
use crate::domain::Env;

use super::{retain_declared, Executor, JobOutcome, JobResult, LogSink};

/// A named in-process job body
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. Returning an error fails the execution with its message.
    async fn run(&self, ctx: &mut JobContext) -> anyhow::Result<()>;
}

/// Everything a handler may see and touch while it runs
#[derive(Debug)]
pub struct JobContext {
    job_id: String,
    env: Env,
    scope: PermissionScope,
    logs: LogSink,
}

impl JobContext {
    fn new(definition: &JobDefinition, env: Env, logs: LogSink) -> Self {
        Self {
            job_id: definition.id.clone(),
            env,
            scope: definition.permission_scope.clone(),
            logs,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Read a variable
    pub fn var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// Read a variable that must be present
    pub fn require_var(&self, name: &str) -> anyhow::Result<&str> {
        self.var(name)
            .ok_or_else(|| anyhow::anyhow!("variable '{}' is not set", name))
    }

    /// Set a variable; only declared outputs are captured
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Append a log line
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(job = %self.job_id, "{}", line);
        self.logs.push(line);
    }

    /// Fail unless the job's scope grants the action
    pub fn require(&self, action: &str) -> Result<(), ScopeError> {
        self.scope.check(action)
    }

    fn into_env(self) -> Env {
        self.env
    }
}

/// Executor dispatching to registered handlers
#[derive(Clone, Default)]
pub struct HandlerExecutor {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name (builder style)
    pub fn with_handler(mut self, name: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.register(name, handler);
        self
    }

    /// Register a handler under a name, replacing any previous one
    pub fn register(&mut self, name: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl Executor for HandlerExecutor {
    fn name(&self) -> &str {
        "handler"
    }

    async fn run(&self, definition: &JobDefinition, env: &Env, timeout: Duration) -> JobResult {
        let ScriptBody::Handler(name) = &definition.script else {
            return JobResult::failed("job has no handler", Vec::new(), 0);
        };

        let Some(handler) = self.handlers.get(name).cloned() else {
            return JobResult::failed(format!("no handler registered as '{}'", name), Vec::new(), 0);
        };

        let started = Instant::now();
        let logs = LogSink::new();
        let mut ctx = JobContext::new(
            definition,
            merge_env(&definition.static_env, env),
            logs.clone(),
        );

        // Dropping the future on timeout cancels the handler at its next await
        let outcome = tokio::time::timeout(timeout, handler.run(&mut ctx)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (outcome, captured_output) = match outcome {
            Ok(Ok(())) => (
                JobOutcome::Succeeded,
                retain_declared(definition, ctx.into_env()),
            ),
            Ok(Err(e)) => (
                JobOutcome::Failed {
                    reason: format!("{:#}", e),
                },
                Env::new(),
            ),
            Err(_) => (JobOutcome::TimedOut { after: timeout }, Env::new()),
        };

        JobResult {
            outcome,
            captured_output,
            logs: logs.snapshot(),
            duration_ms,
        }
    }
}
