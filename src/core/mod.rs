//! Core orchestration logic.
//!
//! This module contains:
//! - Mapper: Event payload <-> job environment mapping
//! - Registry: Job definitions keyed by trigger event type
//! - Scope: Permission scopes jobs run under
//! - Bus: Event publish/subscribe transport
//! - ExecutionStore: Durable, idempotent execution records
//! - Orchestrator: Event-driven execution engine

pub mod bus;
pub mod execution_store;
pub mod journal;
pub mod mapper;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod scope;

// Re-export commonly used types
pub use bus::{BusError, BusRecord, EventBus, EventSink, LocalBus};
pub use execution_store::{Claim, ExecutionRecord, ExecutionStore, StoreError};
pub use journal::{Journal, JournalError};
pub use mapper::{build_failure, build_output, extract_input, merge_env, MapperError, REASON_FIELD};
pub use orchestrator::{redact, Deliveries, Orchestrator, OrchestratorSettings};
pub use registry::{JobDefinition, Registry, RegistryError, ScriptBody};
pub use retry::RetryPolicy;
pub use scope::{PermissionScope, ScopeError, PERMITTED_ACTIONS_VAR};
