use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NodeflowError, Result};

/// What the scheduler does after a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnNodeError {
    /// Keep dispatching every other eligible node.
    #[default]
    Continue,
    /// Stop dispatching new nodes; in-flight nodes still finish.
    Halt,
}

/// How a node whose direct upstream failed is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamFailurePolicy {
    /// Run it; bound inputs resolve to the unavailable sentinel.
    #[default]
    Attempt,
    /// Record it as skipped without invoking the handler.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on handlers in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub on_node_error: OnNodeError,
    #[serde(default)]
    pub upstream_failure: UpstreamFailurePolicy,
    /// Overall run deadline. Unset means no deadline.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            on_node_error: OnNodeError::default(),
            upstream_failure: UpstreamFailurePolicy::default(),
            run_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Runs retained per flow key.
    #[serde(default = "default_history_cap")]
    pub cap: usize,
    #[serde(default)]
    pub backend: HistoryBackend,
    /// SQLite file. Default: <workspace>/history.db
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            cap: default_history_cap(),
            backend: HistoryBackend::default(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Integration node types this installation is entitled to.
    #[serde(default)]
    pub installed: Vec<String>,
}

impl RegistryConfig {
    pub fn installed_set(&self) -> HashSet<String> {
        self.installed.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-node (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutosaveConfig {
    /// SQLite file for graph snapshots. Default: <workspace>/graphs.db
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub autosave: AutosaveConfig,
    /// Environment and secrets exposed to handlers.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            engine: EngineConfig::default(),
            history: HistoryConfig::default(),
            registry: RegistryConfig::default(),
            log: None,
            autosave: AutosaveConfig::default(),
            env: HashMap::new(),
        }
    }
}

fn default_max_concurrency() -> usize { 4 }
fn default_history_cap() -> usize { 50 }
fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }
fn default_workspace() -> String { "~/.nodeflow".to_string() }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| NodeflowError::ConfigNotFound(path.display().to_string()))?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), workspace = %config.workspace, "Loaded config");
        Ok(config)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| NodeflowError::Config(e.to_string()))?;
        if config.engine.max_concurrency == 0 {
            return Err(NodeflowError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    pub fn history_path(&self) -> PathBuf {
        match &self.history.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("history.db"),
        }
    }

    pub fn autosave_path(&self) -> PathBuf {
        match &self.autosave.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("graphs.db"),
        }
    }

    /// Run log directory, or `None` when run logging is off.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref()?;
        if !log.enabled {
            return None;
        }
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// The user's home directory, from `$HOME`.
pub fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_NODEFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_NODEFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_NODEFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_NODEFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_NODEFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.workspace, "~/.nodeflow");
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.engine.on_node_error, OnNodeError::Continue);
        assert_eq!(config.engine.upstream_failure, UpstreamFailurePolicy::Attempt);
        assert!(config.engine.run_timeout().is_none());
        assert_eq!(config.history.cap, 50);
        assert_eq!(config.history.backend, HistoryBackend::Memory);
        assert!(config.registry.installed.is_empty());
        assert!(config.log.is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
workspace = "/srv/nodeflow"

[engine]
max_concurrency = 8
on_node_error = "halt"
upstream_failure = "skip"
run_timeout_secs = 30

[history]
cap = 10
backend = "sqlite"

[registry]
installed = ["http_request", "slack_webhook"]

[log]
level = 1

[env]
SLACK_WEBHOOK_URL = "https://hooks.example.com/x"
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.on_node_error, OnNodeError::Halt);
        assert_eq!(config.engine.upstream_failure, UpstreamFailurePolicy::Skip);
        assert_eq!(config.engine.run_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.history.cap, 10);
        assert_eq!(config.history.backend, HistoryBackend::Sqlite);
        assert_eq!(config.history_path(), PathBuf::from("/srv/nodeflow/history.db"));
        assert_eq!(config.autosave_path(), PathBuf::from("/srv/nodeflow/graphs.db"));
        assert!(config.registry.installed_set().contains("slack_webhook"));
        let log = config.log.as_ref().unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 1);
        assert_eq!(config.log_dir(), Some(PathBuf::from("/srv/nodeflow/logs")));
        assert_eq!(
            config.env.get("SLACK_WEBHOOK_URL").map(String::as_str),
            Some("https://hooks.example.com/x")
        );
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = AppConfig::from_toml("[engine]\nmax_concurrency = 0\n").unwrap_err();
        assert!(matches!(err, NodeflowError::Config(_)));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let err = AppConfig::from_toml("[engine]\non_node_error = \"explode\"\n").unwrap_err();
        assert!(matches!(err, NodeflowError::Config(_)));
    }
}
