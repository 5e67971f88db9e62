//! Lifecycle events carried by the event bus.
//!
//! A lifecycle event describes a state transition for a single tenant. The
//! payload is intentionally flat: it is the same shape as the environment a
//! job script receives, so values are always strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flat string mapping used for event payloads and job environments
pub type Env = BTreeMap<String, String>;

/// Well-known lifecycle event types
pub mod types {
    pub const ONBOARDING_REQUESTED: &str = "onboarding-requested";
    pub const ONBOARDING_SUCCEEDED: &str = "onboarding-succeeded";
    pub const ONBOARDING_FAILED: &str = "onboarding-failed";
    pub const DEPROVISIONING_REQUESTED: &str = "deprovisioning-requested";
    pub const ACTIVATION_REQUESTED: &str = "activation-requested";
    pub const DEACTIVATION_REQUESTED: &str = "deactivation-requested";
}

/// Suffix of event types that ask for work to be done
const REQUESTED_SUFFIX: &str = "-requested";

/// A single lifecycle event.
///
/// `tenant_id` and `correlation_id` live on the envelope, not in the payload,
/// so a job can never forge them through its output variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    /// Lifecycle transition, e.g. `onboarding-requested`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Tenant the transition applies to
    pub tenant_id: String,

    /// Links a request event to the status events derived from it
    #[serde(default)]
    pub correlation_id: String,

    /// Flat string payload
    #[serde(default)]
    pub payload: Env,
}

impl LifecycleEvent {
    /// Create an event with an empty payload
    pub fn new(
        event_type: impl Into<String>,
        tenant_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            tenant_id: tenant_id.into(),
            correlation_id: correlation_id.into(),
            payload: Env::new(),
        }
    }

    /// Create a request event with a freshly generated correlation id
    pub fn request(event_type: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self::new(event_type, tenant_id, Uuid::new_v4().to_string())
    }

    /// Add a payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replace the payload
    pub fn with_payload(mut self, payload: Env) -> Self {
        self.payload = payload;
        self
    }

    /// Fill in a correlation id if the producer left it blank
    pub fn ensure_correlation_id(mut self) -> Self {
        if self.correlation_id.trim().is_empty() {
            self.correlation_id = Uuid::new_v4().to_string();
        }
        self
    }
}

/// Conventional failure event type for a trigger.
///
/// `onboarding-requested` becomes `onboarding-failed`; anything not ending in
/// `-requested` just gets `-failed` appended.
pub fn failure_type_for(trigger_event_type: &str) -> String {
    match trigger_event_type.strip_suffix(REQUESTED_SUFFIX) {
        Some(domain) if !domain.is_empty() => format!("{}-failed", domain),
        _ => format!("{}-failed", trigger_event_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = LifecycleEvent::new(types::ONBOARDING_REQUESTED, "t1", "c1")
            .with_field("tier", "basic");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "onboarding-requested");
        assert_eq!(json["tenantId"], "t1");
        assert_eq!(json["correlationId"], "c1");
        assert_eq!(json["payload"]["tier"], "basic");
    }

    #[test]
    fn test_missing_correlation_id_is_generated() {
        let json = r#"{"type":"activation-requested","tenantId":"t9"}"#;
        let event: LifecycleEvent = serde_json::from_str(json).unwrap();
        assert!(event.correlation_id.is_empty());

        let event = event.ensure_correlation_id();
        assert!(Uuid::parse_str(&event.correlation_id).is_ok());
    }

    #[test]
    fn test_failure_type_convention() {
        assert_eq!(failure_type_for("onboarding-requested"), "onboarding-failed");
        assert_eq!(
            failure_type_for("deprovisioning-requested"),
            "deprovisioning-failed"
        );
        assert_eq!(failure_type_for("tenant-sync"), "tenant-sync-failed");
        assert_eq!(failure_type_for("-requested"), "-requested-failed");
    }
}
