use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::AgentError;

/// Limits for one executor's step loop.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_steps: usize,
    /// Consecutive steps without a tool call before the run is force-completed.
    pub max_thinking_steps: usize,
    /// Failures with one signature that end the run.
    pub error_repeat_threshold: usize,
    /// Number of most recent failures the threshold is counted over.
    pub error_window: usize,
    /// `None` fans every call of a step out at once.
    pub max_parallel_tool_calls: Option<usize>,
    pub synthesize_rejected_tool_results: bool,
    pub wire_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_thinking_steps: 5,
            error_repeat_threshold: 3,
            error_window: 10,
            max_parallel_tool_calls: None,
            synthesize_rejected_tool_results: true,
            wire_capacity: 1024,
        }
    }
}

/// Background subagent pool and history settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    pub max_concurrent: usize,
    pub completed_cache_capacity: usize,
    pub history_capacity: usize,
    pub trigger_line_max_chars: usize,
    pub default_timeout_secs: Option<u64>,
    /// Relative to a subagent's work directory.
    pub state_dir: PathBuf,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            completed_cache_capacity: 50,
            history_capacity: 100,
            trigger_line_max_chars: 200,
            default_timeout_secs: None,
            state_dir: PathBuf::from(".tern").join("async_subagents"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub executor: ExecutorConfig,
    pub subagents: SubagentConfig,
}

impl AgentConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, AgentError> {
        let config: Self = toml::from_str(source)
            .map_err(|error| AgentError::InvalidConfiguration(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let checks = [
            ("executor.max_steps", self.executor.max_steps),
            ("executor.max_thinking_steps", self.executor.max_thinking_steps),
            ("executor.error_repeat_threshold", self.executor.error_repeat_threshold),
            ("executor.error_window", self.executor.error_window),
            ("executor.wire_capacity", self.executor.wire_capacity),
            ("subagents.max_concurrent", self.subagents.max_concurrent),
            (
                "subagents.completed_cache_capacity",
                self.subagents.completed_cache_capacity,
            ),
            ("subagents.history_capacity", self.subagents.history_capacity),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(AgentError::InvalidConfiguration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if self.executor.max_parallel_tool_calls == Some(0) {
            return Err(AgentError::InvalidConfiguration(
                "executor.max_parallel_tool_calls must be greater than zero when set".to_string(),
            ));
        }
        if self.executor.error_window < self.executor.error_repeat_threshold {
            return Err(AgentError::InvalidConfiguration(
                "executor.error_window must be at least executor.error_repeat_threshold"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
