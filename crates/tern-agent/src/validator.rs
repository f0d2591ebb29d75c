use std::collections::HashSet;

use tern_llm::ToolCall;

use crate::repair::{is_strict_json, repair_arguments};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    MissingId,
    DuplicateId,
    MissingName,
    InvalidArguments(String),
}

impl RejectionReason {
    pub fn describe(&self) -> String {
        match self {
            Self::MissingId => "tool call has no id".to_string(),
            Self::DuplicateId => "duplicate tool call id".to_string(),
            Self::MissingName => "tool call has no function name".to_string(),
            Self::InvalidArguments(arguments) => {
                format!("arguments are not valid JSON after repair: {}", arguments)
            }
        }
    }

    /// Whether the dropped call still owns an id nobody else answers for.
    pub fn leaves_unanswered_id(&self) -> bool {
        matches!(self, Self::MissingName | Self::InvalidArguments(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedToolCall {
    pub call: ToolCall,
    pub reason: RejectionReason,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatedToolCalls {
    pub valid: Vec<ToolCall>,
    pub rejected: Vec<RejectedToolCall>,
}

/// Filters one step's raw tool calls, preserving the order of survivors.
///
/// Calls without an id, repeats of an earlier id, calls without a name, and
/// calls whose arguments cannot be repaired into strict JSON are dropped.
/// Survivors carry normalized argument text.
pub fn validate_tool_calls(calls: Vec<ToolCall>) -> ValidatedToolCalls {
    let mut outcome = ValidatedToolCalls::default();
    let mut seen_ids = HashSet::new();

    for call in calls {
        let reason = if call.id.trim().is_empty() {
            Some(RejectionReason::MissingId)
        } else if !seen_ids.insert(call.id.clone()) {
            Some(RejectionReason::DuplicateId)
        } else if call.name.trim().is_empty() {
            Some(RejectionReason::MissingName)
        } else {
            None
        };

        if let Some(reason) = reason {
            reject(&mut outcome, call, reason);
            continue;
        }

        let normalized = repair_arguments(&call.arguments);
        if !is_strict_json(&normalized) {
            reject(&mut outcome, call, RejectionReason::InvalidArguments(normalized));
            continue;
        }

        outcome.valid.push(ToolCall {
            arguments: normalized,
            ..call
        });
    }

    outcome
}

fn reject(outcome: &mut ValidatedToolCalls, call: ToolCall, reason: RejectionReason) {
    tracing::warn!(
        call_id = %call.id,
        tool = %call.name,
        reason = %reason.describe(),
        "dropping tool call"
    );
    outcome.rejected.push(RejectedToolCall { call, reason });
}
