use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SopError};
use crate::sop::RetryPolicy;

/// Top-level sopflow configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub reasoners: Vec<ReasonerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Working directory handed to tools.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Upper bound on cursor moves per run; guards against jump loops.
    #[serde(default = "default_max_transitions")]
    pub max_transitions: usize,
    /// Invocation timeout when neither the step nor the tool sets one.
    #[serde(default = "default_tool_timeout")]
    pub default_tool_timeout_secs: u64,
    /// Retry policy for steps that do not declare one.
    #[serde(default)]
    pub default_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            max_transitions: default_max_transitions(),
            default_tool_timeout_secs: default_tool_timeout(),
            default_retry: RetryPolicy::default(),
        }
    }
}

fn default_workspace() -> String { "~/.sopflow".to_string() }
fn default_max_transitions() -> usize { 1000 }
fn default_tool_timeout() -> u64 { 30 }

/// Largest approval timeout a `chrono::Duration` can hold.
pub const MAX_APPROVAL_TIMEOUT_SECS: u64 = i64::MAX as u64 / 1000;

/// Human approval configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Seconds a run may wait for a decision before `expire_approvals`
    /// rejects it. `None` waits forever.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Snapshot store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file for run snapshots. Default: <workspace>/runs.db
    #[serde(default)]
    pub path: Option<String>,
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = per-step, 3 = per-attempt (default: 2).
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

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// An OpenAI-compatible endpoint used as a dynamic tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonerConfig {
    /// Agent name referenced by dynamic steps.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_base_url() -> String { "http://localhost:11434/v1".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SopError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        Self::from_toml(&expanded)
    }

    fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| SopError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values that parse but cannot be honoured.
    fn check(&self) -> Result<()> {
        if self.engine.default_retry.max_attempts == 0 {
            return Err(SopError::Config(
                "engine.default_retry.max_attempts must be at least 1".into(),
            ));
        }
        if let Some(secs) = self.approval.timeout_secs {
            if secs > MAX_APPROVAL_TIMEOUT_SECS {
                return Err(SopError::Config(format!(
                    "approval.timeout_secs must be at most {}, got {}",
                    MAX_APPROVAL_TIMEOUT_SECS, secs
                )));
            }
        }
        Ok(())
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    /// Snapshot database path.
    pub fn store_path(&self) -> PathBuf {
        match &self.store.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("runs.db"),
        }
    }

    /// Run log directory, if run logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
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
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
