//! Domain types for the tenantflow orchestrator.
//!
//! This module contains the core data structures:
//! - LifecycleEvent: Tenant state transitions exchanged over the bus
//! - JobExecution: One job run for one triggering event

pub mod event;
pub mod execution;

// Re-export commonly used types
pub use event::{failure_type_for, types, Env, LifecycleEvent};
pub use execution::{execution_key, ExecutionState, JobExecution, Transition};
