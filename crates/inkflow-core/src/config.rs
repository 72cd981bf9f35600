use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{InkflowError, Result};

/// Top-level inkflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub refine: RefineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Graph executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node executions per run.
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
    /// Wall-clock deadline per run. 0 disables it.
    #[serde(default)]
    pub run_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recursion_limit: default_recursion_limit(),
            run_timeout_secs: 0,
        }
    }
}

/// Tool-using agent loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model invocations allowed per agent run.
    #[serde(default = "default_max_model_calls")]
    pub max_model_calls: usize,
    /// Execute the tool calls of one reply concurrently.
    #[serde(default = "default_parallel_tools")]
    pub parallel_tools: bool,
    /// Upper bound on any single tool call, in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_model_calls: default_max_model_calls(),
            parallel_tools: default_parallel_tools(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// Generate-validate-refine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    /// Failed validations tolerated before the loop gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Where per-step state snapshots are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// Database file for the sqlite backend.
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            path: default_checkpoint_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_recursion_limit() -> usize { 25 }
fn default_max_model_calls() -> usize { 10 }
fn default_parallel_tools() -> bool { true }
fn default_tool_timeout_secs() -> u64 { 60 }
fn default_max_retries() -> u32 { 3 }
fn default_checkpoint_path() -> String { "inkflow-checkpoints.db".to_string() }
fn default_log_filter() -> String { "inkflow=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| InkflowError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| InkflowError::Config(e.to_string()))
    }

    /// Run deadline, if one is configured.
    pub fn run_timeout(&self) -> Option<std::time::Duration> {
        match self.engine.run_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
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
                // Keep original if env var not set
                Err(_) => {
                    warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
