use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResponse {
    Approve,
    /// Approve this call and every later call of the same tool.
    ApproveForSession,
    Reject,
}

impl ApprovalResponse {
    pub fn is_approved(self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// Human-in-the-loop gate consulted before tools that require approval.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request_approval(&self, tool_name: &str, description: &str) -> ApprovalResponse;

    /// When true the gate is never consulted.
    fn is_auto_approve(&self) -> bool {
        false
    }
}

/// Gate that answers every request the same way.
#[derive(Clone, Copy, Debug)]
pub struct StaticApprovalGate {
    response: ApprovalResponse,
    auto_approve: bool,
}

impl StaticApprovalGate {
    pub fn auto_approve() -> Self {
        Self {
            response: ApprovalResponse::Approve,
            auto_approve: true,
        }
    }

    pub fn always(response: ApprovalResponse) -> Self {
        Self {
            response,
            auto_approve: false,
        }
    }
}

#[async_trait]
impl ApprovalGate for StaticApprovalGate {
    async fn request_approval(&self, _tool_name: &str, _description: &str) -> ApprovalResponse {
        self.response
    }

    fn is_auto_approve(&self) -> bool {
        self.auto_approve
    }
}
