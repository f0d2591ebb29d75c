use crate::{
    ApprovalGate, ApprovalResponse, Context, ExecutionState, ToolError, ToolErrorTracker, Wire,
    WireMessage, validate_tool_calls,
};
use futures::FutureExt;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tern_llm::{Message, ToolCall, ToolResult};

use super::{ToolRegistry, check_arguments};

/// Resolves, approves, and runs the tool calls of one step, writing every
/// result back into the shared context under its call id.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    context: Arc<dyn Context>,
    wire: Wire,
    approval: Option<Arc<dyn ApprovalGate>>,
    session_approvals: Mutex<HashSet<String>>,
    max_parallel: Option<usize>,
    synthesize_rejected: bool,
}

struct CallOutcome {
    result: ToolResult,
    failure_signature: Option<String>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, context: Arc<dyn Context>, wire: Wire) -> Self {
        Self {
            registry,
            context,
            wire,
            approval: None,
            session_approvals: Mutex::new(HashSet::new()),
            max_parallel: None,
            synthesize_rejected: true,
        }
    }

    pub fn with_approval(mut self, approval: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(approval);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel.filter(|limit| *limit > 0);
        self
    }

    pub fn with_rejected_results(mut self, synthesize: bool) -> Self {
        self.synthesize_rejected = synthesize;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn clear_session_approvals(&self) {
        self.lock_approvals().clear();
    }

    /// Validates `calls`, runs the survivors concurrently, and records their
    /// outcomes. Returns results in request order.
    pub async fn dispatch(
        &self,
        calls: Vec<ToolCall>,
        state: &mut ExecutionState,
        tracker: &mut ToolErrorTracker,
    ) -> Vec<ToolResult> {
        let validated = validate_tool_calls(calls);

        if self.synthesize_rejected {
            for rejected in validated
                .rejected
                .iter()
                .filter(|rejected| rejected.reason.leaves_unanswered_id())
            {
                let result = ToolResult::error(
                    rejected.call.id.clone(),
                    rejected.call.name.clone(),
                    format!("invalid tool call: {}", rejected.reason.describe()),
                );
                self.publish(&result);
            }
        }

        let futures = validated.valid.into_iter().map(|call| self.dispatch_single(call));
        let outcomes: Vec<CallOutcome> = match self.max_parallel {
            Some(limit) => stream::iter(futures).buffered(limit).collect().await,
            None => join_all(futures).await,
        };

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            state.task.record_tool(&outcome.result.tool_name);
            if let Some(signature) = outcome.failure_signature {
                tracker.record_failure(signature);
            }
            results.push(outcome.result);
        }
        results
    }

    async fn dispatch_single(&self, call: ToolCall) -> CallOutcome {
        self.wire.send(WireMessage::ToolCall { call: call.clone() });

        let result = match self.run_call(&call).await {
            Ok(output) => {
                tracing::debug!(call_id = %call.id, tool = %call.name, "tool call succeeded");
                CallOutcome {
                    result: ToolResult::success(call.id.clone(), call.name.clone(), output),
                    failure_signature: None,
                }
            }
            Err(error) => {
                tracing::warn!(call_id = %call.id, tool = %call.name, %error, "tool call failed");
                CallOutcome {
                    result: ToolResult::error(call.id.clone(), call.name.clone(), error.to_string()),
                    failure_signature: Some(error_signature(&call.name, &call.arguments)),
                }
            }
        };

        self.publish(&result.result);
        result
    }

    async fn run_call(&self, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        let arguments = serde_json::from_str::<Value>(&call.arguments).map_err(|error| {
            ToolError::Validation(format!(
                "invalid JSON arguments for tool '{}': {}",
                call.name, error
            ))
        })?;
        check_arguments(&tool.definition, &arguments)?;

        if tool.requires_approval {
            self.ensure_approved(&call.name, &tool.approval_description(&arguments))
                .await?;
        }

        let executor = tool.executor.clone();
        let future = std::panic::catch_unwind(AssertUnwindSafe(|| executor(arguments)))
            .map_err(|panic| ToolError::Panicked(panic_message(panic)))?;
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ToolError::Panicked(panic_message(panic))),
        }
    }

    async fn ensure_approved(&self, tool_name: &str, description: &str) -> Result<(), ToolError> {
        let Some(gate) = &self.approval else {
            return Ok(());
        };
        if gate.is_auto_approve() || self.lock_approvals().contains(tool_name) {
            return Ok(());
        }

        let response = gate.request_approval(tool_name, description).await;
        if !response.is_approved() {
            tracing::info!(tool = tool_name, "tool call rejected by approval gate");
            return Err(ToolError::Rejected(description.to_string()));
        }
        if response == ApprovalResponse::ApproveForSession {
            self.lock_approvals().insert(tool_name.to_string());
        }
        Ok(())
    }

    fn publish(&self, result: &ToolResult) {
        self.wire.send(WireMessage::ToolResult {
            result: result.clone(),
        });
        self.context
            .add_message(Message::tool(result.tool_call_id.clone(), result.content.clone()));
    }

    fn lock_approvals(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.session_approvals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stable key for "this tool failed with these arguments".
pub fn error_signature(tool_name: &str, arguments: &str) -> String {
    let canonical = serde_json::from_str::<Value>(arguments)
        .map(|value| value.to_string())
        .unwrap_or_else(|_| arguments.trim().to_string());
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{}:{:016x}", tool_name, hasher.finish())
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tool panicked".to_string()
    }
}
