//! Permission scopes for job execution.
//!
//! A scope is the least-privilege boundary a job runs under:
//! - `actions`: glob patterns naming the capabilities the job may exercise
//!   (e.g. `cloudformation:CreateStack`, `s3:*`)
//! - `inherit_env`: host environment variables passed through to scripts
//!
//! Nothing outside the scope is granted. Scripts start from an empty
//! environment; handlers must `require` each action before using it.
//!
//! Host variables that carry credentials (`HOME`, `AWS_*`, anything named
//! like a token, secret, password or key) can never be inherited. A job that
//! needs cloud credentials gets them from its execution substrate, such as an
//! instance or task role bound to the same actions.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Env;

/// Variable telling scripts which actions they were granted
pub const PERMITTED_ACTIONS_VAR: &str = "TENANTFLOW_PERMITTED_ACTIONS";

/// Host variables a scope may never pass through
const CREDENTIAL_VARIABLES: &[&str] = &[
    "HOME",
    "AWS_*",
    "*TOKEN*",
    "*SECRET*",
    "*PASSWORD*",
    "*CREDENTIAL*",
    "*_KEY",
    "*_KEY_ID",
];

/// Check whether a host variable may carry credentials
pub fn is_credential_variable(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    CREDENTIAL_VARIABLES.iter().any(|pattern_str| {
        Pattern::new(pattern_str)
            .map(|pattern| pattern.matches(&upper))
            .unwrap_or(false)
    })
}

/// Permission boundary for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionScope {
    /// Allowed action patterns
    #[serde(default)]
    pub actions: Vec<String>,

    /// Host variables visible to scripts (default: PATH only)
    #[serde(default = "default_inherit_env")]
    pub inherit_env: Vec<String>,
}

fn default_inherit_env() -> Vec<String> {
    vec!["PATH".to_string()]
}

impl Default for PermissionScope {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            inherit_env: default_inherit_env(),
        }
    }
}

impl PermissionScope {
    /// Scope granting the given action patterns
    pub fn allowing<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Check whether an action matches any allowed pattern
    pub fn permits(&self, action: &str) -> bool {
        self.actions.iter().any(|pattern_str| {
            Pattern::new(pattern_str)
                .map(|pattern| pattern.matches(action))
                .unwrap_or(false)
        })
    }

    /// Fail unless the action is permitted
    pub fn check(&self, action: &str) -> Result<(), ScopeError> {
        if self.permits(action) {
            Ok(())
        } else {
            Err(ScopeError::Denied {
                action: action.to_string(),
            })
        }
    }

    /// Validate action patterns and inherited variables
    pub fn validate(&self) -> Result<(), ScopeError> {
        for pattern in &self.actions {
            Pattern::new(pattern).map_err(|e| ScopeError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.msg.to_string(),
            })?;
        }

        if let Some(name) = self.inherit_env.iter().find(|n| is_credential_variable(n)) {
            return Err(ScopeError::CredentialVariable { name: name.clone() });
        }

        Ok(())
    }

    /// Host variables a script may see, read from the current process.
    ///
    /// Credential-bearing names are skipped even if a scope that bypassed
    /// validation lists them.
    pub fn inherited_env(&self) -> Env {
        self.inherit_env
            .iter()
            .filter(|name| !is_credential_variable(name))
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Value for [`PERMITTED_ACTIONS_VAR`]
    pub fn permitted_actions(&self) -> String {
        self.actions.join(",")
    }
}

/// Permission violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("Action not permitted by scope: {action}")]
    Denied { action: String },

    #[error("Invalid action pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Scope cannot inherit credential variable '{name}'")]
    CredentialVariable { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioning_scope() -> PermissionScope {
        PermissionScope::allowing([
            "cloudformation:CreateStack",
            "cloudformation:DescribeStacks",
            "s3:*",
        ])
    }

    #[test]
    fn test_action_matching() {
        let scope = provisioning_scope();

        assert!(scope.permits("cloudformation:CreateStack"));
        assert!(scope.permits("cloudformation:DescribeStacks"));
        assert!(scope.permits("s3:CreateBucket"));

        assert!(!scope.permits("cloudformation:DeleteStack"));
        assert!(!scope.permits("iam:CreateRole"));
    }

    #[test]
    fn test_empty_scope_denies_everything() {
        let scope = PermissionScope::default();
        assert!(!scope.permits("s3:CreateBucket"));
        assert_eq!(
            scope.check("s3:CreateBucket"),
            Err(ScopeError::Denied {
                action: "s3:CreateBucket".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_pattern() {
        let scope = PermissionScope::allowing(["s3:[Create"]);
        assert!(matches!(
            scope.validate(),
            Err(ScopeError::InvalidPattern { .. })
        ));
        assert!(!scope.permits("s3:[Create"));
    }

    #[test]
    fn test_credential_variables_rejected() {
        for name in ["HOME", "AWS_PROFILE", "AWS_SECRET_ACCESS_KEY", "GITHUB_TOKEN", "db_password", "API_KEY"] {
            let scope = PermissionScope {
                actions: Vec::new(),
                inherit_env: vec!["PATH".to_string(), name.to_string()],
            };
            assert_eq!(
                scope.validate(),
                Err(ScopeError::CredentialVariable {
                    name: name.to_string()
                }),
                "{} should be rejected",
                name
            );
        }

        for name in ["PATH", "LANG", "TZ", "KEYBOARD"] {
            assert!(!is_credential_variable(name), "{} should be allowed", name);
        }
    }

    #[test]
    fn test_inherited_env_skips_credentials() {
        std::env::set_var("TENANTFLOW_SCOPE_TEST_TOKEN", "t0ken");
        std::env::set_var("TENANTFLOW_SCOPE_TEST_REGION", "eu-west-1");

        let scope = PermissionScope {
            actions: Vec::new(),
            inherit_env: vec![
                "TENANTFLOW_SCOPE_TEST_TOKEN".to_string(),
                "TENANTFLOW_SCOPE_TEST_REGION".to_string(),
            ],
        };

        let env = scope.inherited_env();
        assert_eq!(env.len(), 1);
        assert_eq!(env["TENANTFLOW_SCOPE_TEST_REGION"], "eu-west-1");
    }

    #[test]
    fn test_default_inherits_path_only() {
        let scope: PermissionScope = serde_yaml::from_str("actions: ['s3:*']").unwrap();
        assert_eq!(scope.inherit_env, vec!["PATH".to_string()]);
        assert_eq!(scope.permitted_actions(), "s3:*");
    }
}
