//! Shell executor for script-bodied jobs.
//!
//! Each run gets a fresh temporary working directory holding the script.
//! The child starts from an empty environment and only sees:
//! - host variables the permission scope inherits
//! - the job's static variables, overridden by its mapped input
//! - the list of permitted actions
//!
//! Credential-bearing host variables are never inherited. Action patterns
//! are not checked here: for scripts they are enforced by the execution
//! substrate (the role or sandbox the script's tools run under), which the
//! exported action list lets it bind to.
//!
//! The child leads its own process group. On timeout the whole group is
//! sent `SIGKILL`, so nothing the script started outlives the run.
//!
//! After the script ends successfully, a shell `EXIT` trap writes the
//! declared output variables to a capture file, NUL-separated so multi-line
//! values survive. Nothing is read back from failed or timed-out runs.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::core::mapper::merge_env;
use crate::core::registry::{JobDefinition, ScriptBody};
use crate::core::scope::PERMITTED_ACTIONS_VAR;
use crate::domain::Env;

use super::{retain_declared, Executor, JobOutcome, JobResult, LogSink};

const SCRIPT_FILE: &str = "job.sh";
const CAPTURE_FILE: &str = ".tenantflow-output";

/// How long to wait for output pipes to drain after the script exits
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Executor running script bodies through a POSIX shell
pub struct ShellExecutor {
    /// Shell binary (default: "sh")
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor {
    /// Create a shell executor using `sh`
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    /// Create a shell executor with a custom shell binary
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    async fn run_script(
        &self,
        definition: &JobDefinition,
        body: &str,
        env: &Env,
        limit: Duration,
        logs: &LogSink,
    ) -> Result<(JobOutcome, Env)> {
        let workdir = tempfile::Builder::new()
            .prefix("tenantflow-")
            .tempdir()
            .context("Failed to create job working directory")?;

        let capture_path = workdir.path().join(CAPTURE_FILE);
        tokio::fs::write(workdir.path().join(SCRIPT_FILE), body)
            .await
            .context("Failed to write job script")?;

        let wrapper = capture_wrapper(&definition.declared_outputs(), &capture_path);
        let scope = &definition.permission_scope;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&wrapper)
            .current_dir(workdir.path())
            .env_clear()
            .envs(scope.inherited_env())
            .envs(merge_env(&definition.static_env, env))
            .env(PERMITTED_ACTIONS_VAR, scope.permitted_actions())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a timeout can take down everything the script started
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {} for job '{}'", self.shell, definition.id))?;

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_lines(stdout, None, &definition.id, logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_lines(stderr, Some("[stderr] "), &definition.id, logs.clone()));
        }

        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status.context("Failed to wait for job script")?,
            Err(_) => {
                terminate(&mut child, &definition.id).await;
                for pump in pumps {
                    pump.abort();
                }
                return Ok((JobOutcome::TimedOut { after: limit }, Env::new()));
            }
        };

        for pump in pumps {
            if tokio::time::timeout(PIPE_DRAIN_GRACE, pump).await.is_err() {
                debug!(job = %definition.id, "Output still open after exit, detaching");
            }
        }

        if !status.success() {
            let reason = match status.code() {
                Some(code) => format!("script exited with code {}", code),
                None => "script terminated by signal".to_string(),
            };
            return Ok((JobOutcome::Failed { reason }, Env::new()));
        }

        let captured = read_capture(&capture_path).await?;
        Ok((JobOutcome::Succeeded, retain_declared(definition, captured)))
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn run(&self, definition: &JobDefinition, env: &Env, timeout: Duration) -> JobResult {
        let started = Instant::now();
        let logs = LogSink::new();

        let ScriptBody::Shell(body) = &definition.script else {
            return JobResult::failed("job has no shell script", Vec::new(), 0);
        };

        let result = self.run_script(definition, body, env, timeout, &logs).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((outcome, captured_output)) => JobResult {
                outcome,
                captured_output,
                logs: logs.snapshot(),
                duration_ms,
            },
            Err(e) => {
                error!(job = %definition.id, error = %e, "Script execution error");
                JobResult::failed(e.to_string(), logs.snapshot(), duration_ms)
            }
        }
    }
}

/// Stream lines from a child pipe into the log sink
fn pump_lines<R>(
    reader: R,
    prefix: Option<&'static str>,
    job_id: &str,
    logs: LogSink,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let job_id = job_id.to_string();

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(job = %job_id, "{}{}", prefix.unwrap_or(""), line);
            match prefix {
                Some(prefix) => logs.push(format!("{}{}", prefix, line)),
                None => logs.push(line),
            }
        }
    })
}

/// Kill a timed-out script and everything in its process group
async fn terminate(child: &mut Child, job_id: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            #[allow(clippy::cast_possible_wrap)]
            let group = Pid::from_raw(pid as i32);
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                warn!(job = %job_id, pgid = pid, error = %e, "Failed to kill script process group");
            }
        }
    }

    if let Err(e) = child.kill().await {
        warn!(job = %job_id, error = %e, "Failed to kill timed-out script");
    }
}

/// Wrap the job script so declared outputs are written out on clean exit
fn capture_wrapper(outputs: &BTreeSet<&str>, capture_path: &Path) -> String {
    let target = shell_quote(&capture_path.to_string_lossy());

    let mut capture = format!("__tenantflow_capture() {{\n  : > {}\n", target);
    for name in outputs {
        capture.push_str(&format!(
            "  if [ \"${{{name}+set}}\" = set ]; then printf '%s\\0%s\\0' '{name}' \"${name}\" >> {target}; fi\n",
            name = name,
            target = target,
        ));
    }
    capture.push_str("}\n");

    format!(
        "{capture}trap '__tenantflow_status=$?; [ \"$__tenantflow_status\" -ne 0 ] || __tenantflow_capture' EXIT\nset -e\n. ./{script}\n",
        capture = capture,
        script = SCRIPT_FILE,
    )
}

/// Parse the NUL-separated name/value pairs written by the capture trap
async fn read_capture(path: &Path) -> Result<Env> {
    if !path.exists() {
        return Ok(Env::new());
    }

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read captured output: {}", path.display()))?;

    let mut fields = bytes.split(|b| *b == 0);
    let mut env = Env::new();
    while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
        if name.is_empty() {
            break;
        }
        env.insert(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }

    Ok(env)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::registry::Registry;

    fn job(script: &str, timeout_seconds: Option<u64>) -> JobDefinition {
        let registry = Registry::from_yaml(
            r#"
jobs:
  - id: provision
    trigger_event_type: onboarding-requested
    input_fields: [tenantId, tier]
    output_fields:
      onboarding-succeeded: [tenantS3Bucket, tenantStatus]
      tenant-data: [tenantConfig, seenHost, seenActions, seenStatic]
    static_env:
      TEST: test
      tier: default
    permission_scope:
      actions: ["cloudformation:CreateStack", "s3:CreateBucket"]
    script:
      shell: placeholder
"#,
        )
        .unwrap();

        let mut definition = registry.get("provision").unwrap().clone();
        definition.script = ScriptBody::Shell(script.to_string());
        definition.timeout_seconds = timeout_seconds;
        definition
    }

    fn input() -> Env {
        [("tenantId", "t1"), ("tier", "basic")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_captures_declared_outputs() {
        let definition = job(
            r#"
echo "tenantId: $tenantId"
export tenantS3Bucket="bucket-$tenantId-$tier"
export someOtherVariable="this is a test"
export seenStatic="$TEST"
export tenantStatus="created"
"#,
            None,
        );

        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_secs(10))
            .await;

        assert_eq!(result.outcome, JobOutcome::Succeeded);
        assert_eq!(result.captured_output["tenantS3Bucket"], "bucket-t1-basic");
        assert_eq!(result.captured_output["tenantStatus"], "created");
        assert_eq!(result.captured_output["seenStatic"], "test");
        assert!(!result.captured_output.contains_key("someOtherVariable"));
        assert!(!result.captured_output.contains_key("tenantConfig"));
        assert_eq!(result.logs, vec!["tenantId: t1"]);
    }

    #[tokio::test]
    async fn test_multiline_values_survive() {
        let definition = job(
            "tenantConfig=$(printf '{\\n  \"userPoolId\": \"pool\"\\n}')\nexport tenantConfig\n",
            None,
        );

        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_secs(10))
            .await;

        assert_eq!(result.outcome, JobOutcome::Succeeded);
        assert_eq!(
            result.captured_output["tenantConfig"],
            "{\n  \"userPoolId\": \"pool\"\n}"
        );
    }

    #[tokio::test]
    async fn test_environment_is_scoped() {
        std::env::set_var("TENANTFLOW_TEST_HOST_ONLY", "leaked");
        let definition = job(
            r#"
export seenHost="${TENANTFLOW_TEST_HOST_ONLY-unset}"
export seenActions="$TENANTFLOW_PERMITTED_ACTIONS"
"#,
            None,
        );

        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_secs(10))
            .await;

        assert_eq!(result.outcome, JobOutcome::Succeeded);
        assert_eq!(result.captured_output["seenHost"], "unset");
        assert_eq!(
            result.captured_output["seenActions"],
            "cloudformation:CreateStack,s3:CreateBucket"
        );
    }

    #[tokio::test]
    async fn test_early_exit_still_captures() {
        let definition = job("export tenantStatus=created\nexit 0\necho never\n", None);

        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_secs(10))
            .await;

        assert_eq!(result.outcome, JobOutcome::Succeeded);
        assert_eq!(result.captured_output["tenantStatus"], "created");
        assert!(result.logs.is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_logs_and_drops_output() {
        let definition = job(
            "echo starting...\nexport tenantS3Bucket=abc\necho boom >&2\nexit 3\n",
            None,
        );

        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_secs(10))
            .await;

        assert_eq!(
            result.outcome,
            JobOutcome::Failed {
                reason: "script exited with code 3".to_string()
            }
        );
        assert!(result.captured_output.is_empty());
        assert!(result.logs.contains(&"starting...".to_string()));
        assert!(result.logs.contains(&"[stderr] boom".to_string()));
    }

    #[tokio::test]
    async fn test_failing_command_stops_script() {
        let definition = job("false\nexport tenantStatus=created\n", None);

        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_secs(10))
            .await;

        assert!(matches!(result.outcome, JobOutcome::Failed { .. }));
        assert!(result.captured_output.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_script() {
        let definition = job("export tenantStatus=created\nsleep 5\n", Some(1));

        let started = Instant::now();
        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_millis(200))
            .await;

        assert_eq!(
            result.outcome,
            JobOutcome::TimedOut {
                after: Duration::from_millis(200)
            }
        );
        assert!(result.captured_output.is_empty());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        // Zombies waiting for a reaper count as dead
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat.contains(") Z "),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let definition = job("sleep 30 &\necho \"child $!\"\nwait\n", None);

        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_millis(500))
            .await;
        assert!(matches!(result.outcome, JobOutcome::TimedOut { .. }));

        let child: u32 = result
            .logs
            .iter()
            .find_map(|line| line.strip_prefix("child "))
            .and_then(|pid| pid.trim().parse().ok())
            .expect("script should report its background pid");

        let deadline = Instant::now() + Duration::from_secs(2);
        while is_running(child) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_running(child), "background child {} survived the timeout", child);
    }

    #[tokio::test]
    async fn test_host_credentials_are_not_visible() {
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "host-secret");
        std::env::set_var("TENANTFLOW_TEST_DEPLOY_TOKEN", "host-token");

        let mut definition = job(
            r#"
export seenHost="${AWS_SECRET_ACCESS_KEY-unset}/${TENANTFLOW_TEST_DEPLOY_TOKEN-unset}"
"#,
            None,
        );
        // Built in code, so load-time validation never saw these names
        definition.permission_scope.inherit_env = vec![
            "PATH".to_string(),
            "AWS_SECRET_ACCESS_KEY".to_string(),
            "TENANTFLOW_TEST_DEPLOY_TOKEN".to_string(),
        ];

        let result = ShellExecutor::new()
            .run(&definition, &input(), Duration::from_secs(10))
            .await;

        assert_eq!(result.outcome, JobOutcome::Succeeded);
        assert_eq!(result.captured_output["seenHost"], "unset/unset");
    }

    #[tokio::test]
    async fn test_missing_shell_is_a_failure() {
        let definition = job("true\n", None);

        let result = ShellExecutor::with_shell("/nonexistent/tenantflow-shell")
            .run(&definition, &input(), Duration::from_secs(1))
            .await;

        assert!(matches!(result.outcome, JobOutcome::Failed { .. }));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
