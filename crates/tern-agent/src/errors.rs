use thiserror::Error;

/// Top-level error type for the tern-agent crate.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid trigger pattern: {0}")]
    InvalidTriggerPattern(#[from] regex::Error),
    #[error("subagent manager has been shut down")]
    ManagerShutdown,
    #[error("unknown checkpoint: {0}")]
    UnknownCheckpoint(usize),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Llm(#[from] tern_llm::LlmError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Failures that become error tool results rather than run failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool validation failed: {0}")]
    Validation(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("tool call rejected by user: {0}")]
    Rejected(String),
    #[error("tool panicked: {0}")]
    Panicked(String),
}
