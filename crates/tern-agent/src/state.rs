use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tern_llm::Usage;

/// Counters for a single `run()`. Reset when the next run starts.
#[derive(Clone, Debug)]
pub struct TaskMetrics {
    pub started: Instant,
    pub steps: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    tools_used: Vec<String>,
}

impl Default for TaskMetrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            steps: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            tools_used: Vec::new(),
        }
    }
}

impl TaskMetrics {
    pub fn record_usage(&mut self, usage: &Usage) {
        self.input_tokens += usage.prompt_tokens;
        self.output_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
    }

    pub fn record_tool(&mut self, name: &str) {
        if !self.tools_used.iter().any(|used| used == name) {
            self.tools_used.push(name.to_string());
        }
    }

    /// Distinct tool names in first-use order.
    pub fn tools_used(&self) -> &[String] {
        &self.tools_used
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn summary(&self) -> String {
        format!(
            "steps={} tokens={} (input={}, output={}) tools=[{}] elapsed={}ms",
            self.steps,
            self.total_tokens,
            self.input_tokens,
            self.output_tokens,
            self.tools_used.join(", "),
            self.elapsed().as_millis()
        )
    }
}

/// Facts accumulated across runs on one executor. Only `reset` clears it.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub started_at: DateTime<Utc>,
    pub files_modified: BTreeSet<String>,
    pub key_decisions: BTreeSet<String>,
    pub tasks_completed: usize,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            files_modified: BTreeSet::new(),
            key_decisions: BTreeSet::new(),
            tasks_completed: 0,
        }
    }
}

impl SessionState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn summary(&self) -> String {
        format!(
            "session since {}: tasks_completed={} files_modified={} key_decisions={}",
            self.started_at.to_rfc3339(),
            self.tasks_completed,
            self.files_modified.len(),
            self.key_decisions.len()
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionState {
    pub task: TaskMetrics,
    pub session: SessionState,
}

impl ExecutionState {
    pub fn start_task(&mut self) {
        self.task = TaskMetrics::default();
    }

    pub fn record_file_modified(&mut self, path: impl Into<String>) {
        self.session.files_modified.insert(path.into());
    }

    pub fn record_key_decision(&mut self, decision: impl Into<String>) {
        self.session.key_decisions.insert(decision.into());
    }

    pub fn complete_task(&mut self) {
        self.session.tasks_completed += 1;
    }

    pub fn reset_session(&mut self) {
        self.session.reset();
    }

    pub fn summary(&self) -> String {
        format!("{}; {}", self.task.summary(), self.session.summary())
    }
}
