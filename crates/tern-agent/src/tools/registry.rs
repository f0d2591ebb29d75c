use crate::ToolError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tern_llm::ToolDefinition;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;
pub type ApprovalDescriber = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// A tool the model may call: its advertised definition plus the closure that
/// runs it. The executor receives the parsed JSON arguments and owns their
/// deserialization.
#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub executor: ToolExecutor,
    pub requires_approval: bool,
    pub approval_describer: Option<ApprovalDescriber>,
}

impl RegisteredTool {
    pub fn new<F, Fut>(definition: ToolDefinition, executor: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Self {
            definition,
            executor: Arc::new(move |arguments| -> ToolFuture { Box::pin(executor(arguments)) }),
            requires_approval: false,
            approval_describer: None,
        }
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_approval_description<F>(mut self, describe: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.requires_approval = true;
        self.approval_describer = Some(Arc::new(describe));
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn approval_description(&self, arguments: &Value) -> String {
        match &self.approval_describer {
            Some(describe) => describe(arguments),
            None => format!("Run tool '{}' with arguments {}", self.name(), arguments),
        }
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.definition.name.clone(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Definitions for `names` in the requested order; unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| match self.tools.get(name) {
                Some(tool) => Some(tool.definition.clone()),
                None => {
                    tracing::warn!(tool = %name, "agent references unregistered tool");
                    None
                }
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
