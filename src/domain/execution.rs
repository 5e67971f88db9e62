//! Job execution records and their state machine.
//!
//! One execution exists per (triggering event, job) pair. Its state is
//! rebuilt by replaying the transitions recorded for it, in the same way a
//! run is rebuilt from its events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{Env, LifecycleEvent};

/// Idempotency key for an execution: `{correlation_id}:{job_id}`
pub fn execution_key(correlation_id: &str, job_id: &str) -> String {
    format!("{}:{}", correlation_id, job_id)
}

/// State of a job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Claimed, input not yet mapped
    Pending,

    /// Executor invoked
    Running,

    /// Job signalled success
    Succeeded,

    /// Job failed, or its input contract was violated
    Failed,

    /// Job exceeded its wall-clock budget
    TimedOut,

    /// Every status event for the execution reached the bus
    StatusPublished,
}

impl ExecutionState {
    /// Whether the job outcome is settled
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::StatusPublished
        )
    }

    /// Allowed forward transitions. Terminal states never regress.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Succeeded, StatusPublished)
                | (Failed, StatusPublished)
                | (TimedOut, StatusPublished)
        )
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::StatusPublished => "status_published",
        };
        f.write_str(name)
    }
}

/// A single job execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    /// Idempotency key (`{correlation_id}:{job_id}`)
    pub id: String,

    pub tenant_id: String,

    pub correlation_id: String,

    pub job_definition_id: String,

    /// Digest of the job definition that ran
    pub definition_digest: String,

    /// Event type that triggered the execution
    pub trigger_event_type: String,

    pub state: ExecutionState,

    /// Terminal outcome, kept once the state moves on to `StatusPublished`
    pub outcome: Option<ExecutionState>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Declared output variables read back from the job
    #[serde(default)]
    pub captured_output: Env,

    /// Script output lines, attached regardless of outcome
    #[serde(default)]
    pub logs: Vec<String>,

    /// Redacted failure reason
    pub failure_reason: Option<String>,

    /// Status events owed to the bus for this execution
    #[serde(default)]
    pub status_events: Vec<LifecycleEvent>,

    /// How many of `status_events` have been published
    #[serde(default)]
    pub announced: usize,
}

impl JobExecution {
    /// Create a pending execution for a job triggered by `event`
    pub fn pending(
        event: &LifecycleEvent,
        job_definition_id: impl Into<String>,
        definition_digest: impl Into<String>,
    ) -> Self {
        let job_definition_id = job_definition_id.into();

        Self {
            id: execution_key(&event.correlation_id, &job_definition_id),
            tenant_id: event.tenant_id.clone(),
            correlation_id: event.correlation_id.clone(),
            job_definition_id,
            definition_digest: definition_digest.into(),
            trigger_event_type: event.event_type.clone(),
            state: ExecutionState::Pending,
            outcome: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            captured_output: Env::new(),
            logs: Vec::new(),
            failure_reason: None,
            status_events: Vec::new(),
            announced: 0,
        }
    }

    /// State a transition would move this execution into
    pub fn target_state(&self, transition: &Transition) -> ExecutionState {
        match transition {
            Transition::Created { execution } => execution.state,
            Transition::Started { .. } => ExecutionState::Running,
            Transition::Finished { state, .. } => *state,
            Transition::EventAnnounced { .. } => self.state,
            Transition::StatusPublished { .. } => ExecutionState::StatusPublished,
        }
    }

    /// Apply a recorded transition
    pub fn apply(&mut self, transition: &Transition, at: DateTime<Utc>) {
        match transition {
            Transition::Created { execution } => {
                *self = execution.as_ref().clone();
            }
            Transition::Started { .. } => {
                self.state = ExecutionState::Running;
                self.started_at = Some(at);
            }
            Transition::Finished {
                state,
                captured_output,
                logs,
                failure_reason,
                status_events,
                ..
            } => {
                self.state = *state;
                self.outcome = Some(*state);
                self.finished_at = Some(at);
                self.captured_output = captured_output.clone();
                self.logs = logs.clone();
                self.failure_reason = failure_reason.clone();
                self.status_events = status_events.clone();
                self.announced = 0;
            }
            Transition::EventAnnounced { index, .. } => {
                self.announced = self.announced.max(index + 1);
            }
            Transition::StatusPublished { .. } => {
                self.state = ExecutionState::StatusPublished;
                self.announced = self.status_events.len();
            }
        }
    }

    /// Whether the job outcome is settled
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Status events not yet published
    pub fn pending_announcements(&self) -> &[LifecycleEvent] {
        let start = self.announced.min(self.status_events.len());
        &self.status_events[start..]
    }
}

/// A recorded change to an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Execution claimed for an idempotency key
    Created { execution: Box<JobExecution> },

    /// Executor invoked
    Started { id: String },

    /// Job outcome settled, with the status events it owes
    Finished {
        id: String,
        state: ExecutionState,
        #[serde(default)]
        captured_output: Env,
        #[serde(default)]
        logs: Vec<String>,
        failure_reason: Option<String>,
        #[serde(default)]
        status_events: Vec<LifecycleEvent>,
    },

    /// One status event reached the bus
    EventAnnounced { id: String, index: usize },

    /// All status events reached the bus
    StatusPublished { id: String },
}

impl Transition {
    /// Execution this transition belongs to
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Created { execution } => &execution.id,
            Self::Started { id }
            | Self::Finished { id, .. }
            | Self::EventAnnounced { id, .. }
            | Self::StatusPublished { id } => id,
        }
    }
}
