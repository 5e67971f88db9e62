//! Variable mapping between events and job environments.
//!
//! Pure functions only. Input mapping copies a declared subset of an event's
//! payload into a job environment; output mapping copies a declared subset
//! of a job's final environment into a new event.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::domain::{Env, LifecycleEvent};

/// Payload key carrying the reason on failure events
pub const REASON_FIELD: &str = "reason";

/// Input contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapperError {
    #[error("MissingFieldError:{field}")]
    MissingField { field: String },
}

/// Copy the declared `input_fields` out of an event's payload.
///
/// Fails on the first declared field the payload lacks; absent fields are
/// never substituted with empty values.
pub fn extract_input(event: &LifecycleEvent, input_fields: &[String]) -> Result<Env, MapperError> {
    let mut env = Env::new();

    for field in input_fields {
        let value = event
            .payload
            .get(field)
            .ok_or_else(|| MapperError::MissingField {
                field: field.clone(),
            })?;
        env.insert(field.clone(), value.clone());
    }

    Ok(env)
}

/// Build an outgoing event from a job's output.
///
/// Only `output_fields` present in `job_output` are copied. Tenant and
/// correlation ids always come from the triggering context.
pub fn build_output<'a, I>(
    job_output: &Env,
    output_fields: I,
    event_type: &str,
    tenant_id: &str,
    correlation_id: &str,
) -> LifecycleEvent
where
    I: IntoIterator<Item = &'a String>,
{
    let payload = output_fields
        .into_iter()
        .filter_map(|name| job_output.get(name).map(|v| (name.clone(), v.clone())))
        .collect();

    LifecycleEvent::new(event_type, tenant_id, correlation_id).with_payload(payload)
}

/// Build a failure event carrying only the (already redacted) reason
pub fn build_failure(
    event_type: &str,
    tenant_id: &str,
    correlation_id: &str,
    reason: &str,
) -> LifecycleEvent {
    LifecycleEvent::new(event_type, tenant_id, correlation_id).with_field(REASON_FIELD, reason)
}

/// Merge static configuration with mapped input; input wins on conflicts
pub fn merge_env(static_env: &BTreeMap<String, String>, input: &Env) -> Env {
    let mut env = static_env.clone();
    env.extend(input.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extract_declared_fields_only() {
        let event = LifecycleEvent::new("onboarding-requested", "t1", "c1")
            .with_field("tenantId", "t1")
            .with_field("tier", "basic")
            .with_field("adminEmail", "admin@example.com");

        let env = extract_input(&event, &fields(&["tenantId", "tier"])).unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env["tier"], "basic");
        assert!(!env.contains_key("adminEmail"));
    }

    #[test]
    fn test_extract_keeps_values_verbatim() {
        let event = LifecycleEvent::new("onboarding-requested", "t1", "c1")
            .with_field("tier", "  basic\n")
            .with_field("note", "");

        let env = extract_input(&event, &fields(&["tier", "note"])).unwrap();
        assert_eq!(env["tier"], "  basic\n");
        assert_eq!(env["note"], "");
    }

    #[test]
    fn test_extract_missing_field() {
        let event =
            LifecycleEvent::new("onboarding-requested", "t1", "c1").with_field("tenantId", "t1");

        let err = extract_input(&event, &fields(&["tenantId", "tier"])).unwrap_err();
        assert_eq!(
            err,
            MapperError::MissingField {
                field: "tier".to_string()
            }
        );
        assert_eq!(err.to_string(), "MissingFieldError:tier");
    }

    #[test]
    fn test_extract_no_fields() {
        let event = LifecycleEvent::new("activation-requested", "t1", "c1").with_field("x", "y");
        assert!(extract_input(&event, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_build_output_drops_undeclared() {
        let job_output: Env = [
            ("tenantS3Bucket", "abc"),
            ("someOtherVariable", "this is a test"),
            ("tenantId", "forged"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let declared: BTreeSet<String> = ["tenantS3Bucket".to_string()].into_iter().collect();

        let event = build_output(&job_output, &declared, "onboarding-succeeded", "t1", "c1");

        assert_eq!(event.event_type, "onboarding-succeeded");
        assert_eq!(event.tenant_id, "t1");
        assert_eq!(event.correlation_id, "c1");
        assert_eq!(event.payload.len(), 1);
        assert_eq!(event.payload["tenantS3Bucket"], "abc");
    }

    #[test]
    fn test_build_output_skips_unset_declared() {
        let declared: BTreeSet<String> = ["tenantConfig".to_string()].into_iter().collect();
        let event = build_output(&Env::new(), &declared, "tenant-data", "t1", "c1");
        assert!(event.payload.is_empty());
    }

    #[test]
    fn test_build_failure() {
        let event = build_failure("onboarding-failed", "t1", "c1", "MissingFieldError:tier");
        assert_eq!(event.payload.len(), 1);
        assert_eq!(event.payload[REASON_FIELD], "MissingFieldError:tier");
    }

    #[test]
    fn test_merge_precedence() {
        let static_env: BTreeMap<String, String> = [("TEST", "test"), ("tier", "default")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let input: Env = [("tier".to_string(), "premium".to_string())].into_iter().collect();

        let env = merge_env(&static_env, &input);
        assert_eq!(env["TEST"], "test");
        assert_eq!(env["tier"], "premium");
    }
}
