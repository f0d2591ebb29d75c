use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tern_llm::Message;
use tokio::sync::Mutex;

use crate::{AgentExecutor, Context, ExecutionResult, InterruptHandle, SessionState, Wire};

pub const ENGINE_BUSY_MESSAGE: &str = "engine is busy: a run is already in progress";

/// Single-flight front door over one [`AgentExecutor`].
///
/// A second `run` while one is in flight fails immediately instead of
/// queueing.
pub struct Engine {
    executor: Mutex<AgentExecutor>,
    context: Arc<dyn Context>,
    wire: Wire,
    interrupt: InterruptHandle,
    running: AtomicBool,
}

struct RunningGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Engine {
    pub fn new(executor: AgentExecutor) -> Self {
        Self {
            context: executor.context().clone(),
            wire: executor.wire().clone(),
            interrupt: executor.interrupt_handle(),
            executor: Mutex::new(executor),
            running: AtomicBool::new(false),
        }
    }

    pub async fn run(&self, input: &str) -> ExecutionResult {
        self.run_with_context(input, None).await
    }

    /// Like [`Engine::run`], with extra context appended to the user message.
    pub async fn run_with_context(
        &self,
        input: &str,
        additional_context: Option<&str>,
    ) -> ExecutionResult {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("rejecting run while another is in progress");
            return ExecutionResult::error(ENGINE_BUSY_MESSAGE);
        }
        let _guard = RunningGuard {
            running: &self.running,
        };

        let message = match additional_context.filter(|extra| !extra.trim().is_empty()) {
            Some(extra) => format!("{}\n\n{}", input, extra),
            None => input.to_string(),
        };
        self.context.add_message(Message::user(message));

        let mut executor = self.executor.lock().await;
        executor.execute().await
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> &Arc<dyn Context> {
        &self.context
    }

    pub fn wire(&self) -> &Wire {
        &self.wire
    }

    /// `None` while a run holds the executor.
    pub fn session_state(&self) -> Option<SessionState> {
        self.executor
            .try_lock()
            .ok()
            .map(|executor| executor.state().session.clone())
    }

    /// Returns false if a run is in progress.
    pub fn reset_session(&self) -> bool {
        match self.executor.try_lock() {
            Ok(mut executor) => {
                executor.state_mut().reset_session();
                executor.dispatcher().clear_session_approvals();
                true
            }
            Err(_) => false,
        }
    }
}
