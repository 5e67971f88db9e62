//! tenantflow - Event-driven tenant lifecycle job orchestrator
//!
//! Runs provisioning jobs in response to tenant lifecycle events
//! (onboarding, deprovisioning, activation, deactivation) and announces each
//! outcome as a status event on the same bus.
//!
//! # Architecture
//!
//! - A read-only registry maps event types to job definitions
//! - Each delivered event fans out to its jobs, one isolated task per job
//! - Inputs are copied from the event payload into a scoped environment,
//!   declared outputs are copied back out into status events
//! - Every execution transition is journaled, so redelivered events are
//!   idempotent across restarts
//!
//! # Modules
//!
//! - `adapters`: Job executors (shell scripts, in-process handlers)
//! - `core`: Orchestration logic (Registry, Mapper, Bus, ExecutionStore)
//! - `domain`: Data structures (LifecycleEvent, JobExecution)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Check a registry
//! tenantflow validate jobs/provisioning.yaml
//!
//! # Onboard a tenant
//! echo '{"type":"onboarding-requested","tenantId":"t1","payload":{"tenantId":"t1","tier":"basic"}}' \
//!   | tenantflow dispatch
//!
//! # Inspect what ran
//! tenantflow executions --tenant t1
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{Executor, HandlerExecutor, JobContext, JobHandler, ScriptExecutor, ShellExecutor};
pub use core::{EventBus, ExecutionStore, LocalBus, Orchestrator, Registry};
pub use domain::{ExecutionState, JobExecution, LifecycleEvent};
