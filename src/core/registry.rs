//! Job definitions and the registry that routes events to them.
//!
//! Definitions are declared in YAML and loaded once at startup. The registry
//! is immutable afterwards: there is no way to add or change a job while
//! executions are running.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::failure_type_for;

use super::scope::{PermissionScope, ScopeError};

/// What a job executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptBody {
    /// Shell script body
    Shell(String),

    /// Name of an in-process handler
    Handler(String),
}

/// A single job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job id
    pub id: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Event type that triggers the job
    pub trigger_event_type: String,

    /// Payload keys copied into the job environment, in order
    #[serde(default)]
    pub input_fields: Vec<String>,

    /// Outgoing event type -> variables captured into that event
    pub output_fields: BTreeMap<String, BTreeSet<String>>,

    /// Fixed variables, overridable by input fields
    #[serde(default)]
    pub static_env: BTreeMap<String, String>,

    /// Keys of `static_env` whose values must never appear in events
    #[serde(default)]
    pub secrets: BTreeSet<String>,

    /// Least-privilege boundary the job runs under
    #[serde(default)]
    pub permission_scope: PermissionScope,

    /// What to execute, written as `{ shell: .. }` or `{ handler: .. }`
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub script: ScriptBody,

    /// Override timeout for this job (uses the executor default if not set)
    pub timeout_seconds: Option<u64>,

    /// Failure event type (derived from the trigger if not set)
    pub failure_event_type: Option<String>,
}

impl JobDefinition {
    /// Get the effective timeout for this job
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Event type published when the job fails
    pub fn failure_event_type(&self) -> String {
        self.failure_event_type
            .clone()
            .unwrap_or_else(|| failure_type_for(&self.trigger_event_type))
    }

    /// Union of every declared output variable
    pub fn declared_outputs(&self) -> BTreeSet<&str> {
        self.output_fields
            .values()
            .flat_map(|fields| fields.iter().map(String::as_str))
            .collect()
    }

    /// Secret values that must be scrubbed from anything leaving the job
    pub fn secret_values(&self) -> Vec<&str> {
        self.secrets
            .iter()
            .filter_map(|key| self.static_env.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Short content digest (first 16 hex chars of SHA256)
    pub fn digest(&self) -> String {
        let scope = &self.permission_scope;
        let (kind, body) = match &self.script {
            ScriptBody::Shell(body) => ("shell", body),
            ScriptBody::Handler(name) => ("handler", name),
        };
        let timeout = self.timeout_seconds.map(|t| t.to_string()).unwrap_or_default();

        let sections: [(&str, Vec<&str>); 10] = [
            ("id", vec![self.id.as_str()]),
            ("description", vec![self.description.as_str()]),
            ("trigger", vec![self.trigger_event_type.as_str()]),
            ("input", self.input_fields.iter().map(String::as_str).collect()),
            (
                "output",
                self.output_fields
                    .iter()
                    .flat_map(|(event_type, names)| {
                        std::iter::once(event_type.as_str())
                            .chain(names.iter().map(String::as_str))
                            .chain(std::iter::once(""))
                    })
                    .collect(),
            ),
            (
                "static",
                self.static_env
                    .iter()
                    .flat_map(|(k, v)| [k.as_str(), v.as_str()])
                    .collect(),
            ),
            ("secrets", self.secrets.iter().map(String::as_str).collect()),
            (
                "scope",
                scope
                    .actions
                    .iter()
                    .map(String::as_str)
                    .chain(std::iter::once(""))
                    .chain(scope.inherit_env.iter().map(String::as_str))
                    .collect(),
            ),
            ("script", vec![kind, body.as_str()]),
            (
                "limits",
                vec![timeout.as_str(), self.failure_event_type.as_deref().unwrap_or_default()],
            ),
        ];

        let mut hasher = Sha256::new();
        for (name, values) in &sections {
            hasher.update(name.as_bytes());
            hasher.update((values.len() as u64).to_le_bytes());
            for value in values {
                // Length prefix keeps adjacent values from running together
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// Validate the job definition
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::EmptyId);
        }

        if self.trigger_event_type.trim().is_empty() {
            return Err(RegistryError::EmptyTrigger {
                job: self.id.clone(),
            });
        }

        if self.output_fields.is_empty() {
            return Err(RegistryError::NoOutputs {
                job: self.id.clone(),
            });
        }

        let names = self
            .input_fields
            .iter()
            .chain(self.output_fields.values().flatten())
            .chain(self.static_env.keys());
        for name in names {
            if !is_env_identifier(name) {
                return Err(RegistryError::InvalidVariable {
                    job: self.id.clone(),
                    name: name.clone(),
                });
            }
        }

        if let Some(event_type) = self
            .output_fields
            .keys()
            .chain(self.failure_event_type.iter())
            .find(|t| t.trim().is_empty())
        {
            return Err(RegistryError::EmptyEventType {
                job: self.id.clone(),
                found: event_type.clone(),
            });
        }

        if let Some(secret) = self.secrets.iter().find(|s| !self.static_env.contains_key(*s)) {
            return Err(RegistryError::UnknownSecret {
                job: self.id.clone(),
                name: secret.clone(),
            });
        }

        if let ScriptBody::Handler(body) | ScriptBody::Shell(body) = &self.script {
            if body.trim().is_empty() {
                return Err(RegistryError::EmptyScript {
                    job: self.id.clone(),
                });
            }
        }

        self.permission_scope
            .validate()
            .map_err(|source| RegistryError::Scope {
                job: self.id.clone(),
                source,
            })
    }
}

/// Check that a name is usable as an environment variable
fn is_env_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registry validation errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to parse job registry: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Job id cannot be empty")]
    EmptyId,

    #[error("Duplicate job id '{0}'")]
    DuplicateId(String),

    #[error("Job '{job}' has no trigger event type")]
    EmptyTrigger { job: String },

    #[error("Job '{job}' declares no outgoing event types")]
    NoOutputs { job: String },

    #[error("Job '{job}' declares an empty event type '{found}'")]
    EmptyEventType { job: String, found: String },

    #[error("Job '{job}' uses '{name}', which is not a valid variable name")]
    InvalidVariable { job: String, name: String },

    #[error("Job '{job}' marks '{name}' as secret but it is not in static_env")]
    UnknownSecret { job: String, name: String },

    #[error("Job '{job}' has an empty script")]
    EmptyScript { job: String },

    #[error("Job '{job}' has an invalid permission scope: {source}")]
    Scope { job: String, source: ScopeError },
}

/// Registry file schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryFile {
    pub jobs: Vec<JobDefinition>,
}

/// Read-only lookup from event type to the jobs it triggers
#[derive(Debug, Clone, Default)]
pub struct Registry {
    jobs: Vec<Arc<JobDefinition>>,
    by_trigger: HashMap<String, Vec<Arc<JobDefinition>>>,
}

impl Registry {
    /// Build a registry from definitions, validating each
    pub fn new(definitions: Vec<JobDefinition>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(definitions.len());
        let mut by_trigger: HashMap<String, Vec<Arc<JobDefinition>>> = HashMap::new();

        for definition in definitions {
            definition.validate()?;

            if !seen.insert(definition.id.clone()) {
                return Err(RegistryError::DuplicateId(definition.id));
            }

            let definition = Arc::new(definition);
            by_trigger
                .entry(definition.trigger_event_type.clone())
                .or_default()
                .push(Arc::clone(&definition));
            jobs.push(definition);
        }

        Ok(Self { jobs, by_trigger })
    }

    /// Parse a registry from YAML content
    pub fn from_yaml(content: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_yaml::from_str(content)?;
        Self::new(file.jobs)
    }

    /// Load a registry from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job registry: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid job registry: {}", path.display()))
    }

    /// Jobs triggered by an event type, in declaration order
    pub fn jobs_for(&self, event_type: &str) -> Vec<Arc<JobDefinition>> {
        self.by_trigger.get(event_type).cloned().unwrap_or_default()
    }

    /// Every event type some job listens to
    pub fn trigger_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_trigger.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Get a job by id
    pub fn get(&self, id: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.id == id).map(Arc::as_ref)
    }

    /// All jobs in declaration order
    pub fn jobs(&self) -> impl Iterator<Item = &JobDefinition> {
        self.jobs.iter().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
