//! Durable store of job executions.
//!
//! Every transition is appended to a JSONL journal and applied to an
//! in-memory index. Opening a store replays the journal, so execution state
//! (and with it idempotency) survives restarts.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{ExecutionState, JobExecution, Transition};

use super::journal::{Journal, JournalError};

/// Errors raised by the execution store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition for {id}: {from} → {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// One journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,

    pub transition: Transition,
}

/// Result of claiming an idempotency key
#[derive(Debug, Clone)]
pub enum Claim {
    /// New execution created; the caller owns it
    Started(JobExecution),

    /// Another delivery of the same event is being handled right now
    InFlight,

    /// Outcome settled earlier but some status events never reached the bus;
    /// the caller owns the remaining announcements
    Unannounced(JobExecution),

    /// Execution left unfinished by a previous process; the caller owns it
    Abandoned(JobExecution),

    /// Execution fully finished and announced
    Completed(JobExecution),
}

#[derive(Default)]
struct StoreState {
    executions: HashMap<String, JobExecution>,
    in_flight: HashSet<String>,
}

/// Execution store backed by an optional journal
pub struct ExecutionStore {
    journal: Option<Journal>,
    state: Mutex<StoreState>,
}

impl ExecutionStore {
    /// Store kept only in memory
    pub fn in_memory() -> Self {
        Self {
            journal: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Open a journal-backed store, replaying existing records
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let journal = Journal::open(path).await?;
        let records: Vec<ExecutionRecord> = journal.replay().await?;

        let mut state = StoreState::default();
        for record in &records {
            Self::apply_record(&mut state.executions, record);
        }

        debug!(
            path = %journal.path().display(),
            records = records.len(),
            executions = state.executions.len(),
            "Execution store opened"
        );

        Ok(Self {
            journal: Some(journal),
            state: Mutex::new(state),
        })
    }

    fn apply_record(executions: &mut HashMap<String, JobExecution>, record: &ExecutionRecord) {
        let id = record.transition.execution_id().to_string();

        match &record.transition {
            Transition::Created { execution } => {
                executions.insert(id, execution.as_ref().clone());
            }
            other => {
                if let Some(execution) = executions.get_mut(&id) {
                    execution.apply(other, record.timestamp);
                }
            }
        }
    }

    async fn append(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        if let Some(journal) = &self.journal {
            journal.append(record).await?;
        }
        Ok(())
    }

    /// Claim the idempotency key of `execution`.
    ///
    /// Claims are exclusive: until [`ExecutionStore::release`] is called for
    /// the key, every other claim returns [`Claim::InFlight`]. The key is
    /// reserved before the journal write, so the store lock is never held
    /// across disk I/O.
    pub async fn begin(&self, execution: JobExecution) -> Result<Claim, StoreError> {
        let id = execution.id.clone();

        {
            let mut state = self.state.lock().await;

            if state.in_flight.contains(&id) {
                return Ok(Claim::InFlight);
            }

            if let Some(existing) = state.executions.get(&id).cloned() {
                let claim = match existing.state {
                    ExecutionState::StatusPublished => return Ok(Claim::Completed(existing)),
                    s if s.is_terminal() => Claim::Unannounced(existing),
                    _ => Claim::Abandoned(existing),
                };
                state.in_flight.insert(id);
                return Ok(claim);
            }

            state.in_flight.insert(id.clone());
        }

        let record = ExecutionRecord {
            timestamp: execution.created_at,
            transition: Transition::Created {
                execution: Box::new(execution.clone()),
            },
        };
        if let Err(e) = self.append(&record).await {
            self.release(&id).await;
            return Err(e);
        }

        self.state
            .lock()
            .await
            .executions
            .insert(id, execution.clone());

        Ok(Claim::Started(execution))
    }

    /// Record a transition, rejecting any that would regress the state.
    ///
    /// Transitions for one key come from the holder of its claim, so the
    /// state checked before the journal write is still current after it.
    pub async fn transition(&self, transition: Transition) -> Result<JobExecution, StoreError> {
        let id = transition.execution_id().to_string();

        {
            let state = self.state.lock().await;
            Self::check_transition(&state, &id, &transition)?;
        }

        let record = ExecutionRecord {
            timestamp: Utc::now(),
            transition,
        };
        self.append(&record).await?;

        let mut state = self.state.lock().await;
        Self::check_transition(&state, &id, &record.transition)?;
        Self::apply_record(&mut state.executions, &record);
        state
            .executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn check_transition(
        state: &StoreState,
        id: &str,
        transition: &Transition,
    ) -> Result<(), StoreError> {
        let current = state
            .executions
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let target = current.target_state(transition);
        if target != current.state && !current.state.can_transition_to(target) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.state,
                to: target,
            });
        }
        Ok(())
    }

    /// Give up the claim on a key
    pub async fn release(&self, id: &str) {
        self.state.lock().await.in_flight.remove(id);
    }

    /// Look up an execution
    pub async fn get(&self, id: &str) -> Option<JobExecution> {
        self.state.lock().await.executions.get(id).cloned()
    }

    /// All executions, most recent first
    pub async fn list(&self) -> Vec<JobExecution> {
        let state = self.state.lock().await;
        let mut executions: Vec<JobExecution> = state.executions.values().cloned().collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions
    }

    /// Executions for one tenant, most recent first
    pub async fn list_for_tenant(&self, tenant_id: &str) -> Vec<JobExecution> {
        self.list()
            .await
            .into_iter()
            .filter(|e| e.tenant_id == tenant_id)
            .collect()
    }
}
