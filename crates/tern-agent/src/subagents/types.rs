use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{AgentSpec, Context, Wire};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentMode {
    FireAndForget,
    Watch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl SubagentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Invoked once when a subagent finishes on its own (not on cancellation).
pub type SubagentCallback = Arc<dyn Fn(&AsyncSubagent) + Send + Sync>;

/// A background run and its live handles.
#[derive(Clone)]
pub struct AsyncSubagent {
    pub id: String,
    pub name: String,
    pub mode: SubagentMode,
    pub status: SubagentStatus,
    pub agent: AgentSpec,
    pub prompt: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub context: Arc<dyn Context>,
    pub cancel_token: CancellationToken,
    pub callback: Option<SubagentCallback>,
    pub timeout: Option<Duration>,
    pub trigger_pattern: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl AsyncSubagent {
    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }

    pub fn to_record(&self) -> AsyncSubagentRecord {
        AsyncSubagentRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            mode: self.mode,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms: self.duration().num_milliseconds().max(0),
            prompt: self.prompt.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            trigger_pattern: self.trigger_pattern.clone(),
        }
    }
}

impl fmt::Debug for AsyncSubagent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSubagent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("status", &self.status)
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .field("timeout", &self.timeout)
            .field("trigger_pattern", &self.trigger_pattern)
            .field("result", &self.result)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of a finished subagent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncSubagentRecord {
    pub id: String,
    pub name: String,
    pub mode: SubagentMode,
    pub status: SubagentStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub prompt: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trigger_pattern: Option<String>,
}

/// Parameters for a fire-and-forget subagent.
#[derive(Clone)]
pub struct AsyncSubagentRequest {
    pub agent: AgentSpec,
    pub prompt: String,
    pub parent_wire: Option<Wire>,
    pub callback: Option<SubagentCallback>,
    pub timeout: Option<Duration>,
    pub work_dir: Option<PathBuf>,
}

impl AsyncSubagentRequest {
    pub fn new(agent: AgentSpec, prompt: impl Into<String>) -> Self {
        Self {
            agent,
            prompt: prompt.into(),
            parent_wire: None,
            callback: None,
            timeout: None,
            work_dir: None,
        }
    }

    pub fn with_parent_wire(mut self, wire: Wire) -> Self {
        self.parent_wire = Some(wire);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AsyncSubagent) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }
}

/// Parameters for a watch subagent.
#[derive(Clone)]
pub struct WatchRequest {
    pub base: AsyncSubagentRequest,
    pub watch_target: String,
    pub trigger_pattern: String,
    pub on_trigger: Option<String>,
    pub continue_after_trigger: bool,
}

impl WatchRequest {
    pub fn new(
        base: AsyncSubagentRequest,
        watch_target: impl Into<String>,
        trigger_pattern: impl Into<String>,
    ) -> Self {
        Self {
            base,
            watch_target: watch_target.into(),
            trigger_pattern: trigger_pattern.into(),
            on_trigger: None,
            continue_after_trigger: false,
        }
    }

    pub fn on_trigger(mut self, action: impl Into<String>) -> Self {
        self.on_trigger = Some(action.into());
        self
    }

    pub fn continue_after_trigger(mut self, keep_watching: bool) -> Self {
        self.continue_after_trigger = keep_watching;
        self
    }
}
