use serde::{Deserialize, Serialize};
use tern_llm::{ToolCall, ToolResult};
use tokio::sync::broadcast;

use crate::SubagentStatus;

pub const DEFAULT_WIRE_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Reasoning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Everything the core publishes while it runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    StepBegin {
        step: usize,
    },
    StepEnd {
        step: usize,
        has_tool_calls: bool,
    },
    StepInterrupted,
    ContentPart {
        kind: ContentKind,
        text: String,
    },
    ToolCall {
        call: ToolCall,
    },
    ToolResult {
        result: ToolResult,
    },
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        task_total_tokens: u64,
    },
    StatusUpdate {
        level: StatusLevel,
        message: String,
    },
    SubagentStarting {
        id: String,
        name: String,
        prompt: String,
    },
    SubagentCompleted {
        id: String,
        name: String,
        status: SubagentStatus,
        result: Option<String>,
        error: Option<String>,
    },
}

impl WireMessage {
    pub fn status(level: StatusLevel, message: impl Into<String>) -> Self {
        Self::StatusUpdate {
            level,
            message: message.into(),
        }
    }
}

/// Typed publish/subscribe channel. Publishing with no subscribers is a no-op.
#[derive(Clone, Debug)]
pub struct Wire {
    sender: broadcast::Sender<WireMessage>,
}

impl Wire {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn send(&self, message: WireMessage) {
        // An error only means nobody is listening right now.
        let _ = self.sender.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Wire {
    fn default() -> Self {
        Self::new(DEFAULT_WIRE_CAPACITY)
    }
}

/// Takes every message currently buffered for `receiver` without waiting.
pub fn drain_wire(receiver: &mut broadcast::Receiver<WireMessage>) -> Vec<WireMessage> {
    let mut messages = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(message) => messages.push(message),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "wire receiver lagged");
            }
            Err(_) => break,
        }
    }
    messages
}
