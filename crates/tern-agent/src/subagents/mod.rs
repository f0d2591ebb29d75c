//! Background subagents: isolated executor runs the caller does not await.
//!
//! Each subagent gets its own [`InMemoryContext`] and [`Wire`] and shares only
//! the tool registry and model transport with its parent. Runs are spawned on
//! the Tokio runtime and gated by a semaphore sized by
//! [`SubagentConfig::max_concurrent`], independent of any foreground engine.

mod persistence;
mod types;
mod watch;

pub use persistence::{HistoryEntry, SubagentHistoryStore};
pub use types::{
    AsyncSubagent, AsyncSubagentRecord, AsyncSubagentRequest, SubagentCallback, SubagentMode,
    SubagentStatus, WatchRequest,
};
pub use watch::{build_watch_prompt, find_matched_line};

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use regex::Regex;
use tern_llm::ModelTransport;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::tools::panic_message;
use crate::{
    AgentConfig, AgentError, AgentExecutor, AgentSpec, ApprovalGate, Context, Engine,
    ExecutionResult, InMemoryContext, StatusLevel, SubagentConfig, ToolRegistry, Wire,
    WireMessage,
};

const ID_LEN: usize = 8;

/// Starts, tracks, cancels, and records background subagents.
///
/// Cloning is cheap; clones share the same pool and indices.
#[derive(Clone)]
pub struct AsyncSubagentManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn ModelTransport>,
    registry: Arc<ToolRegistry>,
    approval: Option<Arc<dyn ApprovalGate>>,
    config: AgentConfig,
    permits: Arc<Semaphore>,
    index: Mutex<SubagentIndex>,
    stores: Mutex<HashMap<PathBuf, Arc<SubagentHistoryStore>>>,
    finished: Notify,
}

struct SubagentIndex {
    active: HashMap<String, AsyncSubagent>,
    completed: CompletedCache,
}

/// Insertion-ordered, bounded cache of finished subagents.
struct CompletedCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, AsyncSubagent>,
}

impl CompletedCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, subagent: AsyncSubagent) {
        if self.entries.contains_key(&subagent.id) {
            self.order.retain(|id| id != &subagent.id);
        }
        self.order.push_back(subagent.id.clone());
        self.entries.insert(subagent.id.clone(), subagent);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn get(&self, id: &str) -> Option<&AsyncSubagent> {
        self.entries.get(id)
    }

    fn values(&self) -> impl Iterator<Item = &AsyncSubagent> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }
}

/// Everything a spawned pipeline needs, detached from the index entry.
struct Launch {
    id: String,
    name: String,
    agent: AgentSpec,
    prompt: String,
    context: Arc<dyn Context>,
    token: CancellationToken,
    timeout: Option<Duration>,
    parent_wire: Option<Wire>,
    trigger: Option<WatchTrigger>,
}

struct WatchTrigger {
    pattern: Regex,
    continue_after_trigger: bool,
    last_reported: Option<usize>,
}

struct Outcome {
    status: SubagentStatus,
    result: Option<String>,
    error: Option<String>,
}

impl AsyncSubagentManager {
    pub fn new(
        transport: Arc<dyn ModelTransport>,
        registry: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        let max_concurrent = config.subagents.max_concurrent.max(1);
        let completed_capacity = config.subagents.completed_cache_capacity;
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                registry,
                approval: None,
                config,
                permits: Arc::new(Semaphore::new(max_concurrent)),
                index: Mutex::new(SubagentIndex {
                    active: HashMap::new(),
                    completed: CompletedCache::new(completed_capacity),
                }),
                stores: Mutex::new(HashMap::new()),
                finished: Notify::new(),
            }),
        }
    }

    /// Approval gate for tools run by subagents. Must be set before the
    /// manager is cloned or used.
    pub fn with_approval(mut self, approval: Arc<dyn ApprovalGate>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.approval = Some(approval),
            None => tracing::warn!("ignoring approval gate for a manager that is already shared"),
        }
        self
    }

    pub fn config(&self) -> &SubagentConfig {
        &self.inner.config.subagents
    }

    /// Starts a fire-and-forget subagent and returns its id without waiting
    /// for it. Must be called from within a Tokio runtime.
    pub fn start_async(&self, request: AsyncSubagentRequest) -> Result<String, AgentError> {
        let name = request.agent.name.clone();
        let prompt = request.prompt.clone();
        self.launch(request, SubagentMode::FireAndForget, name, prompt, None)
    }

    /// Starts a watch subagent that reports when a tool output matches
    /// `trigger_pattern`, and stops itself unless told to keep watching.
    pub fn start_watcher(&self, request: WatchRequest) -> Result<String, AgentError> {
        let pattern = Regex::new(&request.trigger_pattern)?;
        let prompt = build_watch_prompt(
            &request.base.prompt,
            &request.watch_target,
            &request.trigger_pattern,
            request.on_trigger.as_deref(),
            request.continue_after_trigger,
        );
        let name = format!("{} (Watch)", request.base.agent.name);
        let trigger = WatchTrigger {
            pattern,
            continue_after_trigger: request.continue_after_trigger,
            last_reported: None,
        };
        self.launch(request.base, SubagentMode::Watch, name, prompt, Some(trigger))
    }

    fn launch(
        &self,
        request: AsyncSubagentRequest,
        mode: SubagentMode,
        name: String,
        prompt: String,
        trigger: Option<WatchTrigger>,
    ) -> Result<String, AgentError> {
        if self.inner.permits.is_closed() {
            return Err(AgentError::ManagerShutdown);
        }

        let context: Arc<dyn Context> = Arc::new(InMemoryContext::new());
        let token = CancellationToken::new();
        let timeout = request.timeout.or(self
            .inner
            .config
            .subagents
            .default_timeout_secs
            .map(Duration::from_secs));

        let id = {
            let mut index = self.inner.lock_index();
            let id = unique_id(&index);
            index.active.insert(
                id.clone(),
                AsyncSubagent {
                    id: id.clone(),
                    name: name.clone(),
                    mode,
                    status: SubagentStatus::Pending,
                    agent: request.agent.clone(),
                    prompt: prompt.clone(),
                    start_time: Utc::now(),
                    end_time: None,
                    context: context.clone(),
                    cancel_token: token.clone(),
                    callback: request.callback.clone(),
                    timeout,
                    trigger_pattern: trigger
                        .as_ref()
                        .map(|trigger| trigger.pattern.as_str().to_string()),
                    work_dir: request.work_dir.clone(),
                    result: None,
                    error: None,
                },
            );
            id
        };

        let launch = Launch {
            id: id.clone(),
            name: name.clone(),
            agent: request.agent,
            prompt: prompt.clone(),
            context,
            token,
            timeout,
            parent_wire: request.parent_wire.clone(),
            trigger,
        };
        if let Some(parent) = &request.parent_wire {
            parent.send(WireMessage::SubagentStarting {
                id: id.clone(),
                name: name.clone(),
                prompt,
            });
        }
        tokio::spawn(run_pipeline(self.inner.clone(), launch));

        if let Some(entry) = self.inner.lock_index().active.get_mut(&id) {
            if entry.status == SubagentStatus::Pending {
                entry.status = SubagentStatus::Running;
            }
        }
        tracing::info!(subagent_id = %id, name = %name, ?mode, "subagent started");
        Ok(id)
    }

    /// Cancels an active subagent. Returns false if `id` is not active.
    ///
    /// The run stops at its next step boundary; an in-flight model or tool
    /// call is allowed to finish.
    pub fn cancel(&self, id: &str) -> bool {
        self.inner.cancel(id)
    }

    /// Cancels every active subagent and closes the pool. Later starts fail
    /// with [`AgentError::ManagerShutdown`].
    pub fn shutdown_all(&self) {
        let drained: Vec<AsyncSubagent> = {
            let mut index = self.inner.lock_index();
            index.active.drain().map(|(_, subagent)| subagent).collect()
        };
        for subagent in &drained {
            subagent.cancel_token.cancel();
        }
        self.inner.permits.close();
        self.inner.finished.notify_waiters();
        tracing::info!(cancelled = drained.len(), "subagent manager shut down");
    }

    /// Looks in the active set first, then the completed cache.
    pub fn get_subagent(&self, id: &str) -> Option<AsyncSubagent> {
        let index = self.inner.lock_index();
        index
            .active
            .get(id)
            .or_else(|| index.completed.get(id))
            .cloned()
    }

    /// Active subagents, oldest first.
    pub fn list_active(&self) -> Vec<AsyncSubagent> {
        let mut active: Vec<AsyncSubagent> =
            self.inner.lock_index().active.values().cloned().collect();
        active.sort_by_key(|subagent| subagent.start_time);
        active
    }

    /// Cached finished subagents in the order they finished.
    pub fn list_completed(&self) -> Vec<AsyncSubagent> {
        self.inner.lock_index().completed.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock_index().active.len()
    }

    /// Waits until `id` leaves the active set. Returns its final state, or
    /// `None` if it is unknown or was dropped by [`Self::shutdown_all`].
    pub async fn wait_for(&self, id: &str) -> Option<AsyncSubagent> {
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let index = self.inner.lock_index();
                if !index.active.contains_key(id) {
                    return index.completed.get(id).cloned();
                }
            }
            notified.await;
        }
    }

    /// Persisted history for `work_dir`, newest first.
    pub fn history(&self, work_dir: &Path, limit: usize) -> Vec<AsyncSubagentRecord> {
        self.inner.store_for(work_dir).get_history(limit)
    }

    pub fn clear_history(&self, work_dir: &Path) -> usize {
        self.inner.store_for(work_dir).clear_history()
    }
}

impl ManagerInner {
    fn lock_index(&self) -> MutexGuard<'_, SubagentIndex> {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store_for(&self, work_dir: &Path) -> Arc<SubagentHistoryStore> {
        let mut stores = self
            .stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stores
            .entry(work_dir.to_path_buf())
            .or_insert_with(|| {
                Arc::new(SubagentHistoryStore::for_work_dir(
                    work_dir,
                    &self.config.subagents,
                ))
            })
            .clone()
    }

    fn cancel(&self, id: &str) -> bool {
        let cancelled = {
            let mut index = self.lock_index();
            let Some(mut subagent) = index.active.remove(id) else {
                return false;
            };
            subagent.cancel_token.cancel();
            subagent.status = SubagentStatus::Cancelled;
            subagent.end_time = Some(Utc::now());
            index.completed.insert(subagent.clone());
            subagent
        };
        self.finished.notify_waiters();
        tracing::info!(subagent_id = %cancelled.id, name = %cancelled.name, "subagent cancelled");
        true
    }

    /// Moves a still-active subagent to the completed cache and reports it.
    /// Does nothing if it was cancelled or dropped meanwhile.
    fn finish(&self, id: &str, outcome: Outcome, parent_wire: Option<&Wire>) {
        let finished = {
            let mut index = self.lock_index();
            let Some(mut subagent) = index.active.remove(id) else {
                tracing::debug!(subagent_id = %id, "subagent no longer active; dropping outcome");
                return;
            };
            subagent.status = outcome.status;
            subagent.end_time = Some(Utc::now());
            subagent.result = outcome.result;
            subagent.error = outcome.error;
            index.completed.insert(subagent.clone());
            subagent
        };

        tracing::info!(
            subagent_id = %finished.id,
            name = %finished.name,
            status = %finished.status,
            duration_ms = finished.duration().num_milliseconds(),
            "subagent finished"
        );

        if let Some(parent) = parent_wire {
            parent.send(WireMessage::SubagentCompleted {
                id: finished.id.clone(),
                name: finished.name.clone(),
                status: finished.status,
                result: finished.result.clone(),
                error: finished.error.clone(),
            });
        }

        if let Some(callback) = &finished.callback {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&finished))) {
                tracing::error!(
                    subagent_id = %finished.id,
                    panic = %panic_message(panic),
                    "subagent callback panicked"
                );
            }
        }

        if let Some(work_dir) = &finished.work_dir {
            self.store_for(work_dir).save(&finished.to_record());
        }
        self.finished.notify_waiters();
    }
}

fn unique_id(index: &SubagentIndex) -> String {
    loop {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(ID_LEN);
        if !index.active.contains_key(&id) && index.completed.get(&id).is_none() {
            return id;
        }
    }
}

async fn run_pipeline(inner: Arc<ManagerInner>, launch: Launch) {
    let permits = inner.permits.clone();
    let _permit = tokio::select! {
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(subagent_id = %launch.id, "pool closed before subagent started");
                return;
            }
        },
        _ = launch.token.cancelled() => return,
    };

    let wire = Wire::new(inner.config.executor.wire_capacity);
    let mut executor = AgentExecutor::new(
        launch.agent.clone(),
        inner.transport.clone(),
        launch.context.clone(),
        inner.registry.clone(),
        wire.clone(),
        inner.config.executor.clone(),
    )
    .with_cancellation(launch.token.clone());
    if let Some(approval) = &inner.approval {
        executor = executor.with_approval(approval.clone());
    }
    let engine = Engine::new(executor);

    let bridge = (launch.parent_wire.is_some() || launch.trigger.is_some()).then(|| {
        tokio::spawn(bridge_steps(
            inner.clone(),
            launch.id.clone(),
            launch.name.clone(),
            wire.subscribe(),
            launch.context.clone(),
            launch.parent_wire.clone(),
            launch.trigger,
        ))
    });

    let run = AssertUnwindSafe(engine.run(&launch.prompt)).catch_unwind();
    let outcome = match launch.timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(finished) => outcome_of(finished, launch.context.as_ref()),
            Err(_) => Outcome {
                status: SubagentStatus::Timeout,
                result: None,
                error: Some(format!("timed out after {}ms", limit.as_millis())),
            },
        },
        None => outcome_of(run.await, launch.context.as_ref()),
    };

    drop(engine);
    drop(wire);
    if let Some(bridge) = bridge {
        if let Err(error) = bridge.await {
            tracing::warn!(subagent_id = %launch.id, %error, "subagent step bridge failed");
        }
    }

    inner.finish(&launch.id, outcome, launch.parent_wire.as_ref());
}

fn outcome_of(
    finished: Result<ExecutionResult, Box<dyn std::any::Any + Send>>,
    context: &dyn Context,
) -> Outcome {
    match finished {
        Ok(ExecutionResult::Success { .. }) => Outcome {
            status: SubagentStatus::Completed,
            result: Some(watch::extract_result(&context.history())),
            error: None,
        },
        Ok(ExecutionResult::Error { message }) => Outcome {
            status: SubagentStatus::Failed,
            result: None,
            error: Some(message),
        },
        Ok(ExecutionResult::Interrupted) => Outcome {
            status: SubagentStatus::Cancelled,
            result: None,
            error: None,
        },
        Err(panic) => Outcome {
            status: SubagentStatus::Failed,
            result: None,
            error: Some(format!("subagent panicked: {}", panic_message(panic))),
        },
    }
}

/// Relays step starts to the parent wire and evaluates the watch trigger.
async fn bridge_steps(
    inner: Arc<ManagerInner>,
    id: String,
    name: String,
    mut receiver: broadcast::Receiver<WireMessage>,
    context: Arc<dyn Context>,
    parent_wire: Option<Wire>,
    mut trigger: Option<WatchTrigger>,
) {
    let max_chars = inner.config.subagents.trigger_line_max_chars;
    loop {
        let step = match receiver.recv().await {
            Ok(WireMessage::StepBegin { step }) => step,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(subagent_id = %id, skipped, "subagent bridge lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if let Some(parent) = &parent_wire {
            parent.send(WireMessage::status(
                StatusLevel::Info,
                format!("Async subagent {} - Step {}", name, step),
            ));
        }

        let Some(watch) = trigger.as_mut() else {
            continue;
        };
        let Some((position, output)) = watch::last_tool_output(context.as_ref()) else {
            continue;
        };
        let is_new = watch.last_reported.is_none_or(|seen| position > seen);
        if !is_new || !watch.pattern.is_match(&output) {
            continue;
        }
        watch.last_reported = Some(position);

        let line = find_matched_line(&output, &watch.pattern, max_chars);
        tracing::info!(subagent_id = %id, matched = %line, "watch trigger matched");
        if let Some(parent) = &parent_wire {
            parent.send(WireMessage::status(
                StatusLevel::Info,
                format!("Watch trigger matched: {}", line),
            ));
        }
        if !watch.continue_after_trigger {
            inner.cancel(&id);
        }
    }
}
