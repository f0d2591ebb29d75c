use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tern_llm::{
    AccumulatedResponse, LlmError, Message, ModelTransport, StreamAccumulator, StreamFragment,
    ToolDefinition,
};
use tokio_util::sync::CancellationToken;

use crate::{
    ApprovalGate, ContentKind, Context, ExecutionState, ExecutorConfig, LoopGuard, StatusLevel,
    ToolDispatcher, ToolErrorTracker, ToolRegistry, Wire, WireMessage,
};

/// What an agent is: its prompt and which registered tools it may call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub system_prompt: String,
    /// `None` exposes every registered tool.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            tools: None,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        response: String,
        steps_executed: usize,
        tokens_used: u64,
    },
    Error {
        message: String,
    },
    Interrupted,
}

impl ExecutionResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message } => Some(message),
            _ => None,
        }
    }
}

/// Cloneable flag checked at every step boundary.
#[derive(Clone, Debug, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Drives the step loop for one agent over one context.
pub struct AgentExecutor {
    agent: AgentSpec,
    transport: Arc<dyn ModelTransport>,
    context: Arc<dyn Context>,
    dispatcher: ToolDispatcher,
    wire: Wire,
    config: ExecutorConfig,
    state: ExecutionState,
    loop_guard: LoopGuard,
    error_tracker: ToolErrorTracker,
    interrupt: InterruptHandle,
    cancellation: Option<CancellationToken>,
    last_response: String,
}

impl AgentExecutor {
    pub fn new(
        agent: AgentSpec,
        transport: Arc<dyn ModelTransport>,
        context: Arc<dyn Context>,
        registry: Arc<ToolRegistry>,
        wire: Wire,
        config: ExecutorConfig,
    ) -> Self {
        let dispatcher = ToolDispatcher::new(registry, context.clone(), wire.clone())
            .with_max_parallel(config.max_parallel_tool_calls)
            .with_rejected_results(config.synthesize_rejected_tool_results);
        Self {
            agent,
            transport,
            context,
            dispatcher,
            wire,
            loop_guard: LoopGuard::new(config.max_thinking_steps),
            error_tracker: ToolErrorTracker::new(
                config.error_repeat_threshold,
                config.error_window,
            ),
            config,
            state: ExecutionState::default(),
            interrupt: InterruptHandle::default(),
            cancellation: None,
            last_response: String::new(),
        }
    }

    pub fn with_approval(mut self, approval: Arc<dyn ApprovalGate>) -> Self {
        self.dispatcher = self.dispatcher.with_approval(approval);
        self
    }

    /// Treats cancellation of `token` like an interrupt. Unlike the interrupt
    /// flag it is never cleared by a new run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ExecutionState {
        &mut self.state
    }

    pub fn agent(&self) -> &AgentSpec {
        &self.agent
    }

    pub fn context(&self) -> &Arc<dyn Context> {
        &self.context
    }

    pub fn wire(&self) -> &Wire {
        &self.wire
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Runs steps until the agent finishes, fails, or is interrupted. The
    /// caller is expected to have appended the user input already.
    pub async fn execute(&mut self) -> ExecutionResult {
        self.state.start_task();
        self.interrupt.clear();
        self.loop_guard.reset();
        self.error_tracker.clear();
        self.last_response.clear();
        self.context.create_checkpoint(0);

        let tools = self.tool_definitions();
        let result = self.run_loop(&tools).await;
        if result.is_success() {
            self.state.complete_task();
        }
        tracing::info!(
            agent = %self.agent.name,
            summary = %self.state.task.summary(),
            success = result.is_success(),
            "execution finished"
        );
        result
    }

    async fn run_loop(&mut self, tools: &[ToolDefinition]) -> ExecutionResult {
        loop {
            if let Some(result) = self.check_step_guards() {
                return result;
            }

            let step = self.state.task.steps + 1;
            self.state.task.steps = step;
            self.context.create_checkpoint(step);
            self.wire.send(WireMessage::StepBegin { step });
            tracing::debug!(agent = %self.agent.name, step, "step started");

            let response = match self.call_model(tools).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::error!(agent = %self.agent.name, step, %error, "model call failed");
                    return ExecutionResult::error(error.to_string());
                }
            };

            let has_tool_calls = self.record_response(step, &response);
            if has_tool_calls {
                self.loop_guard.record_tool_step();
                self.dispatcher
                    .dispatch(response.tool_calls, &mut self.state, &mut self.error_tracker)
                    .await;
            } else {
                self.loop_guard.record_no_tool_step();
            }
        }
    }

    fn check_step_guards(&mut self) -> Option<ExecutionResult> {
        let cancelled = self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled);
        if self.interrupt.is_interrupted() || cancelled {
            tracing::info!(agent = %self.agent.name, "execution interrupted");
            self.wire.send(WireMessage::StepInterrupted);
            return Some(ExecutionResult::Interrupted);
        }

        if self.state.task.steps + 1 > self.config.max_steps {
            let message = format!("maximum step limit ({}) exceeded", self.config.max_steps);
            tracing::warn!(agent = %self.agent.name, "{}", message);
            self.wire
                .send(WireMessage::status(StatusLevel::Warning, message.clone()));
            return Some(ExecutionResult::error(message));
        }

        if self.loop_guard.should_force_complete() {
            tracing::warn!(
                agent = %self.agent.name,
                steps = self.loop_guard.consecutive_no_tool_steps(),
                "forcing completion after consecutive steps without tool calls"
            );
            return Some(ExecutionResult::Success {
                response: self.last_response.clone(),
                steps_executed: self.state.task.steps,
                tokens_used: self.state.task.total_tokens,
            });
        }

        if let Some(signature) = self.error_tracker.repeated_signature() {
            let message = format!("tool call keeps failing with identical arguments ({})", signature);
            tracing::warn!(agent = %self.agent.name, "{}", message);
            self.wire
                .send(WireMessage::status(StatusLevel::Warning, message.clone()));
            return Some(ExecutionResult::error(message));
        }

        None
    }

    async fn call_model(&self, tools: &[ToolDefinition]) -> Result<AccumulatedResponse, LlmError> {
        let history = self.context.history();
        let mut stream = self
            .transport
            .generate_stream(&self.agent.system_prompt, &history, tools)
            .await?;

        let mut accumulator = StreamAccumulator::new();
        while let Some(chunk) = stream.next().await {
            for fragment in accumulator.process(&chunk?) {
                let (kind, text) = match fragment {
                    StreamFragment::Text(text) => (ContentKind::Text, text),
                    StreamFragment::Reasoning(text) => (ContentKind::Reasoning, text),
                };
                self.wire.send(WireMessage::ContentPart { kind, text });
            }
        }
        Ok(accumulator.finish())
    }

    /// Books usage, appends the assistant message, and closes the step.
    fn record_response(&mut self, step: usize, response: &AccumulatedResponse) -> bool {
        if let Some(usage) = &response.usage {
            self.state.task.record_usage(usage);
            self.wire.send(WireMessage::TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
                task_total_tokens: self.state.task.total_tokens,
            });
        }

        let content = (!response.content.is_empty()).then(|| response.content.clone());
        if let Some(content) = &content {
            self.last_response = content.clone();
        }
        self.context
            .add_message(Message::assistant(content, response.tool_calls.clone()));

        let has_tool_calls = response.has_tool_calls();
        self.wire.send(WireMessage::StepEnd {
            step,
            has_tool_calls,
        });
        has_tool_calls
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let registry = self.dispatcher.registry();
        match &self.agent.tools {
            Some(names) => registry.definitions_for(names),
            None => registry.definitions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryContext;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tern_llm::{ChatChunk, ChunkStream, Role, Usage, chunk_stream};

    struct QueueTransport {
        responses: Mutex<VecDeque<Result<Vec<ChatChunk>, LlmError>>>,
        calls: Mutex<usize>,
    }

    impl QueueTransport {
        fn new(responses: Vec<Result<Vec<ChatChunk>, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().expect("calls mutex")
        }
    }

    #[async_trait]
    impl ModelTransport for QueueTransport {
        async fn generate_stream(
            &self,
            _system_prompt: &str,
            _history: &[Message],
            _tools: &[ToolDefinition],
        ) -> Result<ChunkStream, LlmError> {
            *self.calls.lock().expect("calls mutex") += 1;
            let next = self
                .responses
                .lock()
                .expect("responses mutex")
                .pop_front()
                .unwrap_or_else(|| Ok(vec![ChatChunk::content("idle")]));
            next.map(|chunks| chunk_stream(chunks.into_iter().map(Ok).collect()))
        }
    }

    fn executor(transport: Arc<QueueTransport>, config: ExecutorConfig) -> AgentExecutor {
        let context = Arc::new(InMemoryContext::new());
        context.add_message(Message::user("hello"));
        AgentExecutor::new(
            AgentSpec::new("tester", "be brief"),
            transport,
            context,
            Arc::new(ToolRegistry::new()),
            Wire::default(),
            config,
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn answers_without_tools_until_thinking_limit() {
        let transport = Arc::new(QueueTransport::new(vec![
            Ok(vec![
                ChatChunk::content("Hi"),
                ChatChunk::usage(Usage {
                    prompt_tokens: 3,
                    completion_tokens: 1,
                    total_tokens: 4,
                }),
            ]),
            Ok(vec![ChatChunk::content("Still here")]),
        ]));
        let config = ExecutorConfig {
            max_thinking_steps: 2,
            ..ExecutorConfig::default()
        };
        let mut executor = executor(transport.clone(), config);

        let result = executor.execute().await;

        assert_eq!(
            result,
            ExecutionResult::Success {
                response: "Still here".to_string(),
                steps_executed: 2,
                tokens_used: 4,
            }
        );
        assert_eq!(transport.calls(), 2);
        assert_eq!(executor.state().session.tasks_completed, 1);
        let roles: Vec<Role> = executor.context().history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Assistant]);
    }

    #[test]
    fn agent_tool_list_limits_advertised_definitions() {
        let mut registry = ToolRegistry::new();
        for name in ["read", "write"] {
            registry.register(crate::RegisteredTool::new(
                ToolDefinition {
                    name: name.to_string(),
                    description: String::new(),
                    parameters: serde_json::json!({"type": "object"}),
                },
                |_| async { Ok(String::new()) },
            ));
        }
        let executor = AgentExecutor::new(
            AgentSpec::new("reader", "read only").with_tools(["read"]),
            Arc::new(QueueTransport::new(Vec::new())),
            Arc::new(InMemoryContext::new()),
            Arc::new(registry),
            Wire::default(),
            ExecutorConfig::default(),
        );

        let names: Vec<String> = executor
            .tool_definitions()
            .into_iter()
            .map(|definition| definition.name)
            .collect();
        assert_eq!(names, vec!["read".to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_failure_becomes_error_result() {
        let transport = Arc::new(QueueTransport::new(vec![Err(LlmError::Transport(
            "connection reset".to_string(),
        ))]));
        let mut executor = executor(transport, ExecutorConfig::default());

        let result = executor.execute().await;

        assert_eq!(
            result.error_message(),
            Some("transport error: connection reset")
        );
        assert_eq!(executor.state().session.tasks_completed, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn step_limit_stops_the_loop() {
        let transport = Arc::new(QueueTransport::new(Vec::new()));
        let config = ExecutorConfig {
            max_steps: 3,
            max_thinking_steps: 10,
            error_window: 10,
            ..ExecutorConfig::default()
        };
        let mut executor = executor(transport.clone(), config);

        let result = executor.execute().await;

        assert_eq!(result.error_message(), Some("maximum step limit (3) exceeded"));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn interrupt_is_reported_at_next_step_boundary() {
        let transport = Arc::new(QueueTransport::new(Vec::new()));
        let token = CancellationToken::new();
        let mut executor =
            executor(transport.clone(), ExecutorConfig::default()).with_cancellation(token.clone());
        let mut receiver = executor.wire().subscribe();
        token.cancel();

        let result = executor.execute().await;

        assert_eq!(result, ExecutionResult::Interrupted);
        assert_eq!(transport.calls(), 0);
        assert_eq!(
            crate::drain_wire(&mut receiver),
            vec![WireMessage::StepInterrupted]
        );
    }
}
