use std::collections::{HashMap, VecDeque};

/// Counts consecutive steps in which the model called no tools.
#[derive(Clone, Debug)]
pub struct LoopGuard {
    max_thinking_steps: usize,
    consecutive_no_tool_steps: usize,
}

impl LoopGuard {
    pub fn new(max_thinking_steps: usize) -> Self {
        Self {
            max_thinking_steps,
            consecutive_no_tool_steps: 0,
        }
    }

    pub fn record_no_tool_step(&mut self) {
        self.consecutive_no_tool_steps += 1;
    }

    pub fn record_tool_step(&mut self) {
        self.consecutive_no_tool_steps = 0;
    }

    pub fn should_force_complete(&self) -> bool {
        self.consecutive_no_tool_steps >= self.max_thinking_steps
    }

    pub fn consecutive_no_tool_steps(&self) -> usize {
        self.consecutive_no_tool_steps
    }

    pub fn reset(&mut self) {
        self.consecutive_no_tool_steps = 0;
    }
}

/// Detects a tool failing over and over with the same arguments.
///
/// Keeps the most recent `window` failure signatures; the run should stop once
/// any one signature appears `threshold` times among them.
#[derive(Clone, Debug)]
pub struct ToolErrorTracker {
    threshold: usize,
    window: usize,
    recent: VecDeque<String>,
    counts: HashMap<String, usize>,
}

impl ToolErrorTracker {
    pub fn new(threshold: usize, window: usize) -> Self {
        Self {
            threshold,
            window: window.max(threshold).max(1),
            recent: VecDeque::new(),
            counts: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, signature: impl Into<String>) {
        let signature = signature.into();
        *self.counts.entry(signature.clone()).or_default() += 1;
        self.recent.push_back(signature);

        while self.recent.len() > self.window {
            let Some(evicted) = self.recent.pop_front() else {
                break;
            };
            if let Some(count) = self.counts.get_mut(&evicted) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&evicted);
                }
            }
        }
    }

    pub fn should_terminate(&self) -> bool {
        self.repeated_signature().is_some()
    }

    /// The signature that crossed the threshold, if any.
    pub fn repeated_signature(&self) -> Option<&str> {
        self.counts
            .iter()
            .filter(|(_, count)| **count >= self.threshold)
            .max_by_key(|(_, count)| **count)
            .map(|(signature, _)| signature.as_str())
    }

    pub fn failure_count(&self, signature: &str) -> usize {
        self.counts.get(signature).copied().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.counts.clear();
    }
}
