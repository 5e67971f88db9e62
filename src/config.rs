//! Configuration for tenantflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TENANTFLOW_HOME, TENANTFLOW_REGISTRY)
//! 2. Config file (.tenantflow/config.yaml)
//! 3. Defaults (~/.tenantflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .tenantflow/config.yaml
//! - `paths.home` is relative to the .tenantflow/ directory
//! - `paths.registry` is relative to the project root (parent of .tenantflow/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".tenantflow";
const CONFIG_FILE: &str = "config.yaml";

pub const HOME_ENV: &str = "TENANTFLOW_HOME";
pub const REGISTRY_ENV: &str = "TENANTFLOW_REGISTRY";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub publish: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory for journals (relative to .tenantflow/)
    pub home: Option<String>,
    /// Job registry file (relative to project root)
    pub registry: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorConfig {
    pub timeout_seconds: Option<u64>,
    pub shell: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory (bus and execution journals)
    pub home: PathBuf,
    /// Job registry file
    pub registry: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub executor: ExecutorSettings,
    /// Backoff for status event publishes
    pub publish: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorSettings {
    /// Default per-job time budget
    pub timeout_seconds: u64,
    /// Shell used for script bodies
    pub shell: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            shell: "sh".to_string(),
        }
    }
}

impl ResolvedConfig {
    /// Journal of every event published on the local bus
    pub fn bus_journal_path(&self) -> PathBuf {
        self.home.join("bus.jsonl")
    }

    /// Journal of execution transitions
    pub fn executions_path(&self) -> PathBuf {
        self.home.join("executions.jsonl")
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment overrides, read once per load
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    registry: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var(HOME_ENV).ok(),
            registry: std::env::var(REGISTRY_ENV).ok(),
        }
    }
}

/// Combine the config file, environment overrides and defaults
fn resolve(
    config_file: Option<PathBuf>,
    overrides: EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let (config, config_dir, base_dir) = match &config_file {
        Some(config_path) => {
            let config = load_config_file(config_path)?;
            let config_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let base_dir = config_dir.parent().unwrap_or(Path::new(".")).to_path_buf();
            (config, config_dir, base_dir)
        }
        None => (
            ConfigFile::default(),
            PathBuf::from("."),
            PathBuf::from("."),
        ),
    };

    let home = match (overrides.home, &config.paths.home) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(home_path)) => resolve_path(&config_dir, home_path),
        (None, None) => default_home,
    };

    let registry = match (overrides.registry, &config.paths.registry) {
        (Some(env_registry), _) => PathBuf::from(env_registry),
        (None, Some(registry_path)) => resolve_path(&base_dir, registry_path),
        (None, None) => home.join("jobs.yaml"),
    };

    let defaults = ExecutorSettings::default();
    let executor = config.executor.unwrap_or_default();
    let executor = ExecutorSettings {
        timeout_seconds: executor.timeout_seconds.unwrap_or(defaults.timeout_seconds),
        shell: executor.shell.unwrap_or(defaults.shell),
    };

    Ok(ResolvedConfig {
        home,
        registry,
        config_file,
        executor,
        publish: config.publish.unwrap_or_default(),
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    resolve(find_config_file(&cwd), EnvOverrides::from_env(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (bypasses the cache)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the tenantflow state directory
pub fn tenantflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the job registry path
pub fn registry_path() -> Result<PathBuf> {
    Ok(config()?.registry.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(root: &Path, content: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join(CONFIG_FILE);
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", content).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, EnvOverrides::default(), PathBuf::from("/srv/.tenantflow")).unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/.tenantflow"));
        assert_eq!(config.registry, PathBuf::from("/srv/.tenantflow/jobs.yaml"));
        assert_eq!(config.executor, ExecutorSettings::default());
        assert_eq!(config.publish, RetryPolicy::default());
        assert_eq!(config.bus_journal_path(), PathBuf::from("/srv/.tenantflow/bus.jsonl"));
        assert_eq!(
            config.executions_path(),
            PathBuf::from("/srv/.tenantflow/executions.jsonl")
        );
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
paths:
  home: ./state
  registry: jobs/provisioning.yaml
executor:
  timeout_seconds: 60
publish:
  max_attempts: 3
"#,
        );

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version.as_deref(), Some("1.0"));
        assert_eq!(config.paths.home.as_deref(), Some("./state"));
        assert_eq!(config.executor.unwrap().timeout_seconds, Some(60));

        let publish = config.publish.unwrap();
        assert_eq!(publish.max_attempts, 3);
        assert_eq!(publish.initial_delay_ms, 200);
    }

    #[test]
    fn test_file_paths_resolve_against_project() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
paths:
  home: ./state
  registry: jobs/provisioning.yaml
executor:
  shell: bash
"#,
        );

        let config = resolve(
            Some(config_path.clone()),
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        )
        .unwrap();

        assert_eq!(config.home, temp.path().join(CONFIG_DIR).join("state"));
        assert_eq!(config.registry, temp.path().join("jobs/provisioning.yaml"));
        assert_eq!(config.executor.shell, "bash");
        assert_eq!(config.executor.timeout_seconds, 300);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_env_overrides_win() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "paths:\n  home: ./state\n");

        let config = resolve(
            Some(config_path),
            EnvOverrides {
                home: Some("/var/lib/tenantflow".to_string()),
                registry: Some("/etc/tenantflow/jobs.yaml".to_string()),
            },
            PathBuf::from("/unused"),
        )
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/var/lib/tenantflow"));
        assert_eq!(config.registry, PathBuf::from("/etc/tenantflow/jobs.yaml"));
    }

    #[test]
    fn test_discovery_walks_parents() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "version: \"1.0\"");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(config_path));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
