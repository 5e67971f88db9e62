//! Event-driven orchestrator for tenant lifecycle jobs.
//!
//! Routes each delivered event to the jobs registered for its type, runs
//! every job as an isolated task, and announces each outcome on the bus.
//!
//! Per job the execution moves through
//! `Pending -> Running -> {Succeeded, Failed, TimedOut} -> StatusPublished`,
//! with every step recorded in the execution store before it takes effect.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::adapters::{Executor, JobOutcome};
use crate::config::ResolvedConfig;
use crate::domain::{execution_key, Env, ExecutionState, JobExecution, LifecycleEvent, Transition};

use super::bus::{BusError, EventBus, EventSink};
use super::execution_store::{Claim, ExecutionStore, StoreError};
use super::mapper::{build_failure, build_output, extract_input, MapperError};
use super::registry::{JobDefinition, Registry};
use super::retry::RetryPolicy;

/// Failure kind for input contract violations
pub const MISSING_FIELD: &str = "MissingFieldError";

/// Failure kind for jobs that ran and failed
pub const EXECUTION_FAILURE: &str = "ExecutionFailure";

/// Failure kind for jobs terminated at their time budget
pub const TIMEOUT_FAILURE: &str = "TimeoutFailure";

/// Longest failure reason carried by an event
const MAX_REASON_CHARS: usize = 256;

const SECRET_MASK: &str = "***";

/// Receiving end of [`Orchestrator::subscribe_all`]
pub type Deliveries = mpsc::UnboundedReceiver<LifecycleEvent>;

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Time budget for jobs without their own `timeout_seconds`
    pub default_timeout: Duration,

    /// Backoff for status event publishes
    pub publish_retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            publish_retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.executor.timeout_seconds),
            publish_retry: config.publish.clone(),
        }
    }
}

/// Lifecycle job orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<Registry>,
    bus: Arc<dyn EventBus>,
    executor: Arc<dyn Executor>,
    store: Arc<ExecutionStore>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Create an orchestrator with default settings
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<dyn EventBus>,
        executor: Arc<dyn Executor>,
        store: Arc<ExecutionStore>,
    ) -> Self {
        Self {
            registry,
            bus,
            executor,
            store,
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Look up one execution by idempotency key
    pub async fn execution(&self, key: &str) -> Option<JobExecution> {
        self.store.get(key).await
    }

    /// All executions, most recent first
    pub async fn executions(&self) -> Vec<JobExecution> {
        self.store.list().await
    }

    /// Handle one delivered event.
    ///
    /// Every job registered for the event's type runs in its own task; a
    /// failing or panicking job never affects the others. Returns the
    /// executions this delivery settled, skipping duplicates still in flight
    /// elsewhere. Unregistered event types are a no-op.
    #[instrument(
        skip(self, event),
        fields(
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            correlation_id = %event.correlation_id
        )
    )]
    pub async fn handle_event(&self, event: LifecycleEvent) -> Vec<JobExecution> {
        let jobs = self.registry.jobs_for(&event.event_type);
        if jobs.is_empty() {
            debug!("No jobs registered for event type");
            return Vec::new();
        }

        let event = if event.correlation_id.trim().is_empty() {
            warn!("Event has no correlation id, assigning one");
            event.ensure_correlation_id()
        } else {
            event
        };

        let tasks: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let this = self.clone();
                let task_job = Arc::clone(&job);
                let task_event = event.clone();
                let handle = tokio::spawn(
                    async move { this.process_job(&task_job, &task_event).await }
                        .in_current_span(),
                );
                (job, handle)
            })
            .collect();

        let mut executions = Vec::new();
        for (job, handle) in tasks {
            let settled = match handle.await {
                Ok(settled) => settled,
                Err(e) => {
                    error!(job = %job.id, error = %e, "Job task aborted");
                    self.recover_aborted(&job, &event).await
                }
            };

            match settled {
                Ok(Some(execution)) => executions.push(execution),
                Ok(None) => {}
                Err(e) => error!(job = %job.id, error = %e, "Failed to record execution"),
            }
        }

        executions
    }

    /// Subscribe to every trigger type and handle deliveries until
    /// `shutdown` resolves, then drain in-flight work.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), BusError>
    where
        F: Future<Output = ()> + Send,
    {
        let deliveries = self.subscribe_all().await?;
        self.serve(deliveries, shutdown).await;
        Ok(())
    }

    /// Subscribe one channel to every registered trigger type
    pub async fn subscribe_all(&self) -> Result<Deliveries, BusError> {
        let (sink, deliveries) = mpsc::unbounded_channel();
        for event_type in self.registry.trigger_types() {
            self.subscribe_with_retry(event_type, sink.clone()).await?;
        }
        Ok(deliveries)
    }

    /// Handle deliveries until `shutdown` resolves, then drain.
    ///
    /// Events published while draining (e.g. by chained jobs) are still
    /// handled; the call returns once nothing is left to do.
    pub async fn serve<F>(&self, mut deliveries: Deliveries, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            triggers = self.registry.trigger_types().len(),
            jobs = self.registry.len(),
            "Orchestrator listening"
        );

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                delivered = deliveries.recv() => match delivered {
                    Some(event) => self.spawn_delivery(&mut tasks, event),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Event task failed");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Shutting down, draining deliveries");

        loop {
            while let Ok(event) = deliveries.try_recv() {
                self.spawn_delivery(&mut tasks, event);
            }
            match tasks.join_next().await {
                Some(Err(e)) => error!(error = %e, "Event task failed"),
                Some(Ok(())) => {}
                None => break,
            }
        }

        info!("Orchestrator stopped");
    }

    fn spawn_delivery(&self, tasks: &mut JoinSet<()>, event: LifecycleEvent) {
        let this = self.clone();
        tasks.spawn(async move {
            this.handle_event(event).await;
        });
    }

    async fn subscribe_with_retry(&self, event_type: &str, sink: EventSink) -> Result<(), BusError> {
        let policy = &self.settings.publish_retry;
        let mut attempt = 1;

        loop {
            match self.bus.subscribe(event_type, sink.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(event_type, attempt, error = %e, "Subscribe failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(event_type, attempt, error = %e, "Subscribe failed, giving up");
                    return Err(e);
                }
            }
        }
    }

    /// Claim the execution key for one job and settle it
    async fn process_job(
        &self,
        job: &JobDefinition,
        event: &LifecycleEvent,
    ) -> Result<Option<JobExecution>, StoreError> {
        let pending = JobExecution::pending(event, &job.id, job.digest());
        let key = pending.id.clone();

        let claim = self.store.begin(pending).await?;
        if matches!(claim, Claim::InFlight) {
            debug!(job = %job.id, execution = %key, "Duplicate delivery while in flight, skipping");
            return Ok(None);
        }

        let settled = self.settle(job, event, claim).await;
        self.store.release(&key).await;
        settled
    }

    async fn settle(
        &self,
        job: &JobDefinition,
        event: &LifecycleEvent,
        claim: Claim,
    ) -> Result<Option<JobExecution>, StoreError> {
        let execution = match claim {
            Claim::InFlight => return Ok(None),
            Claim::Started(execution) => self.execute(job, event, execution).await?,
            Claim::Completed(execution) => {
                info!(job = %job.id, execution = %execution.id, "Already completed, skipping");
                execution
            }
            Claim::Unannounced(execution) => {
                info!(
                    job = %job.id,
                    execution = %execution.id,
                    outstanding = execution.pending_announcements().len(),
                    "Outcome already settled, resuming announcements"
                );
                self.announce(execution).await?
            }
            Claim::Abandoned(execution) => {
                warn!(
                    job = %job.id,
                    execution = %execution.id,
                    state = %execution.state,
                    "Execution interrupted by a previous shutdown, marking failed"
                );
                self.fail_and_announce(job, &execution, "interrupted before completion")
                    .await?
            }
        };

        Ok(Some(execution))
    }

    /// Settle an execution whose task panicked or was cancelled
    async fn recover_aborted(
        &self,
        job: &JobDefinition,
        event: &LifecycleEvent,
    ) -> Result<Option<JobExecution>, StoreError> {
        let key = execution_key(&event.correlation_id, &job.id);

        // The dead task still holds the claim
        self.store.release(&key).await;

        let claim = self
            .store
            .begin(JobExecution::pending(event, &job.id, job.digest()))
            .await?;

        let settled = match claim {
            Claim::InFlight => return Ok(None),
            Claim::Started(execution) | Claim::Abandoned(execution) => self
                .fail_and_announce(job, &execution, "job panicked")
                .await
                .map(Some),
            other => self.settle(job, event, other).await,
        };

        self.store.release(&key).await;
        settled
    }

    /// Mark an unfinished execution failed without running the job
    async fn fail_and_announce(
        &self,
        job: &JobDefinition,
        execution: &JobExecution,
        detail: &str,
    ) -> Result<JobExecution, StoreError> {
        let reason = redact(EXECUTION_FAILURE, detail, &[]);
        let logs = execution.logs.clone();
        let execution = self
            .finish(job, execution, ExecutionState::Failed, Env::new(), logs, Some(reason))
            .await?;
        self.announce(execution).await
    }

    /// Map input, run the job and announce its outcome
    async fn execute(
        &self,
        job: &JobDefinition,
        event: &LifecycleEvent,
        execution: JobExecution,
    ) -> Result<JobExecution, StoreError> {
        let secrets = job.secret_values();

        let input = match extract_input(event, &job.input_fields) {
            Ok(input) => input,
            Err(MapperError::MissingField { field }) => {
                warn!(job = %job.id, field = %field, "Input contract violated, job not run");
                let reason = redact(MISSING_FIELD, &field, &secrets);
                let execution = self
                    .finish(job, &execution, ExecutionState::Failed, Env::new(), Vec::new(), Some(reason))
                    .await?;
                return self.announce(execution).await;
            }
        };

        let execution = self
            .store
            .transition(Transition::Started {
                id: execution.id.clone(),
            })
            .await?;

        let timeout = job.timeout(self.settings.default_timeout);
        info!(
            job = %job.id,
            executor = self.executor.name(),
            timeout_ms = timeout.as_millis() as u64,
            "Running job"
        );

        let result = self.executor.run(job, &input, timeout).await;

        let (state, failure_reason) = match &result.outcome {
            JobOutcome::Succeeded => {
                info!(
                    job = %job.id,
                    duration_ms = result.duration_ms,
                    outputs = result.captured_output.len(),
                    "Job succeeded"
                );
                (ExecutionState::Succeeded, None)
            }
            JobOutcome::Failed { reason } => {
                let reason = redact(EXECUTION_FAILURE, reason, &secrets);
                error!(job = %job.id, duration_ms = result.duration_ms, reason = %reason, "Job failed");
                (ExecutionState::Failed, Some(reason))
            }
            JobOutcome::TimedOut { after } => {
                warn!(
                    job = %job.id,
                    after_ms = after.as_millis() as u64,
                    "Job timed out and was terminated"
                );
                let detail = format!("exceeded {:?}", after);
                (ExecutionState::TimedOut, Some(redact(TIMEOUT_FAILURE, &detail, &secrets)))
            }
        };

        let captured_output = if state == ExecutionState::Succeeded {
            result.captured_output
        } else {
            Env::new()
        };

        let execution = self
            .finish(job, &execution, state, captured_output, result.logs, failure_reason)
            .await?;
        self.announce(execution).await
    }

    /// Record the terminal outcome together with the events it owes
    async fn finish(
        &self,
        job: &JobDefinition,
        execution: &JobExecution,
        state: ExecutionState,
        captured_output: Env,
        logs: Vec<String>,
        failure_reason: Option<String>,
    ) -> Result<JobExecution, StoreError> {
        let status_events = match &failure_reason {
            None => job
                .output_fields
                .iter()
                .map(|(event_type, fields)| {
                    build_output(
                        &captured_output,
                        fields,
                        event_type,
                        &execution.tenant_id,
                        &execution.correlation_id,
                    )
                })
                .collect(),
            Some(reason) => vec![build_failure(
                &job.failure_event_type(),
                &execution.tenant_id,
                &execution.correlation_id,
                reason,
            )],
        };

        self.store
            .transition(Transition::Finished {
                id: execution.id.clone(),
                state,
                captured_output,
                logs,
                failure_reason,
                status_events,
            })
            .await
    }

    /// Publish outstanding status events, then mark the execution published.
    ///
    /// Stops at the first event that cannot be published; the rest stay
    /// outstanding until the triggering event is delivered again.
    async fn announce(&self, mut execution: JobExecution) -> Result<JobExecution, StoreError> {
        let start = execution.announced.min(execution.status_events.len());
        let outstanding: Vec<LifecycleEvent> = execution.pending_announcements().to_vec();

        for (offset, event) in outstanding.iter().enumerate() {
            if let Err(e) = self.publish_with_retry(event).await {
                error!(
                    execution = %execution.id,
                    event_type = %event.event_type,
                    attempts = self.settings.publish_retry.max_attempts,
                    error = %e,
                    "Status event not published, retries exhausted"
                );
                return Ok(execution);
            }

            execution = self
                .store
                .transition(Transition::EventAnnounced {
                    id: execution.id.clone(),
                    index: start + offset,
                })
                .await?;
        }

        let execution = self
            .store
            .transition(Transition::StatusPublished {
                id: execution.id.clone(),
            })
            .await?;

        info!(
            execution = %execution.id,
            outcome = ?execution.outcome,
            events = execution.status_events.len(),
            "Execution status published"
        );
        Ok(execution)
    }

    async fn publish_with_retry(&self, event: &LifecycleEvent) -> Result<(), BusError> {
        let policy = &self.settings.publish_retry;
        let mut attempt = 1;

        loop {
            match self.bus.publish(event).await {
                Ok(()) => return Ok(()),
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        event_type = %event.event_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build an event-safe failure reason: `Kind:detail`, first line of the
/// detail only, secret values masked, bounded length.
pub fn redact(kind: &str, detail: &str, secrets: &[&str]) -> String {
    let mut detail = detail.lines().next().unwrap_or_default().trim().to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        detail = detail.replace(secret, SECRET_MASK);
    }

    let reason = if detail.is_empty() {
        kind.to_string()
    } else {
        format!("{}:{}", kind, detail)
    };

    reason.chars().take(MAX_REASON_CHARS).collect()
}
