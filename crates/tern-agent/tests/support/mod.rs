#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tern_agent::{
    AgentConfig, AgentExecutor, AgentSpec, Engine, ExecutorConfig, InMemoryContext,
    RegisteredTool, ToolError, ToolRegistry, Wire,
};
use tern_llm::{
    ChatChunk, ChunkStream, LlmError, Message, ModelTransport, ToolDefinition, Usage,
    chunk_stream,
};

#[derive(Clone, Debug)]
pub enum Reply {
    Chunks(Vec<ChatChunk>),
    Fail(LlmError),
}

pub fn text_reply(text: &str) -> Reply {
    Reply::Chunks(vec![ChatChunk::content(text)])
}

pub fn tool_reply(id: &str, name: &str, arguments: &str) -> Reply {
    Reply::Chunks(vec![ChatChunk::tool_call_start(id, name, arguments)])
}

pub fn usage(prompt_tokens: u64, completion_tokens: u64) -> ChatChunk {
    ChatChunk::usage(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    })
}

/// Replays queued replies, then repeats the fallback. Records every request.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Duration,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: text_reply("done"),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: Reply) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests mutex").len()
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().expect("requests mutex").clone()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn generate_stream(
        &self,
        _system_prompt: &str,
        history: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError> {
        self.requests
            .lock()
            .expect("requests mutex")
            .push(history.to_vec());
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }

        let reply = self
            .replies
            .lock()
            .expect("replies mutex")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Chunks(chunks) => Ok(chunk_stream(chunks.into_iter().map(Ok).collect())),
            Reply::Fail(error) => Err(error),
        }
    }
}

fn definition(name: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: format!("{} tool", name),
        parameters,
    }
}

/// Echoes its `text` argument.
pub fn echo_tool() -> RegisteredTool {
    RegisteredTool::new(
        definition(
            "echo",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        ),
        |arguments| async move {
            Ok(arguments
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string())
        },
    )
}

/// Always fails; counts how often it ran.
pub fn failing_tool(name: &str, runs: Arc<AtomicUsize>) -> RegisteredTool {
    RegisteredTool::new(definition(name, json!({"type": "object"})), move |_| {
        let runs = runs.clone();
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Err(ToolError::Execution("disk on fire".to_string()))
        }
    })
}

/// Returns a fixed output after an optional pause.
pub fn probe_tool(output: &str, pause: Duration) -> RegisteredTool {
    let output = output.to_string();
    RegisteredTool::new(definition("probe", json!({"type": "object"})), move |_| {
        let output = output.clone();
        async move {
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            Ok(output)
        }
    })
}

pub fn registry(tools: Vec<RegisteredTool>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    Arc::new(registry)
}

pub fn engine(
    transport: Arc<ScriptedTransport>,
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
) -> Engine {
    let executor = AgentExecutor::new(
        AgentSpec::new("main", "You are a helpful agent."),
        transport,
        Arc::new(InMemoryContext::new()),
        registry,
        Wire::default(),
        config,
    );
    Engine::new(executor)
}

pub fn fast_subagent_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.executor.max_thinking_steps = 1;
    config
}
