use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tern_llm::{Message, Role};

use crate::AgentError;

/// Conversation history shared by the executor and concurrently completing
/// tool calls. Implementations must be internally synchronized.
pub trait Context: Send + Sync {
    fn add_message(&self, message: Message);

    fn history(&self) -> Vec<Message>;

    fn create_checkpoint(&self, step: usize);

    fn restore_checkpoint(&self, step: usize) -> Result<(), AgentError>;

    fn replace_history(&self, messages: Vec<Message>);

    fn clear(&self);

    fn last_message(&self) -> Option<Message> {
        self.history().pop()
    }

    fn last_message_with_role(&self, role: Role) -> Option<Message> {
        self.history()
            .into_iter()
            .rev()
            .find(|message| message.role == role)
    }
}

#[derive(Default)]
struct ContextState {
    messages: Vec<Message>,
    checkpoints: BTreeMap<usize, usize>,
}

#[derive(Default)]
pub struct InMemoryContext {
    state: Mutex<ContextState>,
}

impl InMemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(messages: Vec<Message>) -> Self {
        Self {
            state: Mutex::new(ContextState {
                messages,
                checkpoints: BTreeMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checkpoints(&self) -> Vec<usize> {
        self.lock().checkpoints.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Context for InMemoryContext {
    fn add_message(&self, message: Message) {
        self.lock().messages.push(message);
    }

    fn history(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    fn create_checkpoint(&self, step: usize) {
        let mut state = self.lock();
        let length = state.messages.len();
        state.checkpoints.insert(step, length);
    }

    fn restore_checkpoint(&self, step: usize) -> Result<(), AgentError> {
        let mut state = self.lock();
        let length = *state
            .checkpoints
            .get(&step)
            .ok_or(AgentError::UnknownCheckpoint(step))?;
        state.messages.truncate(length);
        state.checkpoints.retain(|checkpoint, _| *checkpoint <= step);
        Ok(())
    }

    fn replace_history(&self, messages: Vec<Message>) {
        let mut state = self.lock();
        state.messages = messages;
        state.checkpoints.clear();
    }

    fn clear(&self) {
        let mut state = self.lock();
        state.messages.clear();
        state.checkpoints.clear();
    }

    fn last_message(&self) -> Option<Message> {
        self.lock().messages.last().cloned()
    }

    fn last_message_with_role(&self, role: Role) -> Option<Message> {
        self.lock()
            .messages
            .iter()
            .rev()
            .find(|message| message.role == role)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn restore_checkpoint_truncates_later_messages() {
        let context = InMemoryContext::new();
        context.add_message(Message::user("hi"));
        context.create_checkpoint(1);
        context.add_message(Message::assistant(Some("hello".to_string()), Vec::new()));
        context.create_checkpoint(2);
        context.add_message(Message::user("again"));

        context.restore_checkpoint(1).expect("checkpoint exists");

        assert_eq!(context.history(), vec![Message::user("hi")]);
        assert_eq!(context.checkpoints(), vec![1]);
    }

    #[test]
    fn seeded_history_is_visible_and_clearable() {
        let context = InMemoryContext::with_history(vec![
            Message::system("rules"),
            Message::user("question"),
        ]);
        assert_eq!(context.len(), 2);
        assert_eq!(context.last_message(), Some(Message::user("question")));

        context.clear();
        assert!(context.is_empty());
    }

    #[test]
    fn unknown_checkpoint_is_an_error() {
        let context = InMemoryContext::new();
        let error = context.restore_checkpoint(9).expect_err("missing checkpoint");
        assert!(matches!(error, AgentError::UnknownCheckpoint(9)));
    }

    #[test]
    fn last_message_with_role_skips_other_roles() {
        let context = InMemoryContext::new();
        context.add_message(Message::tool("call_1", "out"));
        context.add_message(Message::assistant(Some("done".to_string()), Vec::new()));

        let tool = context.last_message_with_role(Role::Tool).expect("tool message");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_all_kept() {
        let context = Arc::new(InMemoryContext::new());
        let handles: Vec<_> = (0..32)
            .map(|index| {
                let context = context.clone();
                tokio::spawn(async move {
                    context.add_message(Message::tool(format!("call_{index}"), "ok"));
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("append task");
        }

        let mut ids: Vec<String> = context
            .history()
            .into_iter()
            .filter_map(|message| message.tool_call_id)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
    }
}
