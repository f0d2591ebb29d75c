//! Stream accumulator that rebuilds one model response from chunk sequences.

use crate::types::{ChatChunk, ChunkDelta, ToolCall, Usage};

/// Text the accumulator wants forwarded to live subscribers as it arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFragment {
    Text(String),
    Reasoning(String),
}

/// Final state of one streamed step. Tool calls are not yet validated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccumulatedResponse {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl AccumulatedResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one chunk in and returns the fragments that should be forwarded
    /// to subscribers immediately.
    pub fn process(&mut self, chunk: &ChatChunk) -> Vec<StreamFragment> {
        // Transports report cumulative usage, so the latest snapshot wins.
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let Some(delta) = chunk.choices.first().and_then(|choice| choice.delta.as_ref()) else {
            return Vec::new();
        };
        self.apply_delta(delta)
    }

    fn apply_delta(&mut self, delta: &ChunkDelta) -> Vec<StreamFragment> {
        let mut forwarded = Vec::new();

        if let Some(text) = delta.content.as_deref().filter(|text| !text.is_empty()) {
            self.content.push_str(text);
            forwarded.push(StreamFragment::Text(text.to_string()));
        }

        if let Some(text) = delta
            .reasoning_content
            .as_deref()
            .filter(|text| !text.is_empty())
        {
            self.reasoning.push_str(text);
            forwarded.push(StreamFragment::Reasoning(text.to_string()));
        }

        for fragment in &delta.tool_calls {
            if fragment.id.is_some() || fragment.name.is_some() {
                self.tool_calls.push(ToolCall {
                    id: fragment.id.clone().unwrap_or_default(),
                    name: fragment.name.clone().unwrap_or_default(),
                    arguments: fragment.arguments.clone().unwrap_or_default(),
                });
                continue;
            }

            let Some(arguments) = fragment.arguments.as_deref() else {
                continue;
            };
            match self.tool_calls.last_mut() {
                Some(last) => last.arguments.push_str(arguments),
                None => tracing::debug!(
                    fragment = arguments,
                    "dropping tool-call continuation with no open tool call"
                ),
            }
        }

        forwarded
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn finish(self) -> AccumulatedResponse {
        AccumulatedResponse {
            content: self.content,
            reasoning: self.reasoning,
            tool_calls: self.tool_calls,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkDelta, ToolCallDelta};

    #[test]
    fn accumulates_text_and_forwards_fragments() {
        let mut acc = StreamAccumulator::new();

        let first = acc.process(&ChatChunk::content("Hel"));
        let second = acc.process(&ChatChunk::content("lo"));
        let thinking = acc.process(&ChatChunk::reasoning("pondering"));

        assert_eq!(first, vec![StreamFragment::Text("Hel".to_string())]);
        assert_eq!(second, vec![StreamFragment::Text("lo".to_string())]);
        assert_eq!(
            thinking,
            vec![StreamFragment::Reasoning("pondering".to_string())]
        );

        let response = acc.finish();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.reasoning, "pondering");
        assert!(!response.has_tool_calls());
    }

    #[test]
    fn reassembles_arguments_split_across_chunks() {
        let mut acc = StreamAccumulator::new();
        acc.process(&ChatChunk::tool_call_start("call_1", "lookup", "{\"a\":"));
        acc.process(&ChatChunk::tool_call_arguments("1"));
        acc.process(&ChatChunk::tool_call_arguments("}"));

        let response = acc.finish();
        assert_eq!(response.tool_calls, vec![ToolCall::new("call_1", "lookup", "{\"a\":1}")]);
    }

    #[test]
    fn continuation_appends_to_most_recent_call() {
        let mut acc = StreamAccumulator::new();
        acc.process(&ChatChunk::tool_call_start("call_1", "first", "{}"));
        acc.process(&ChatChunk::from_delta(ChunkDelta {
            tool_calls: vec![ToolCallDelta {
                id: None,
                name: Some("second".to_string()),
                arguments: Some("{\"x\":".to_string()),
            }],
            ..Default::default()
        }));
        acc.process(&ChatChunk::tool_call_arguments("2}"));

        let response = acc.finish();
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].arguments, "{}");
        assert_eq!(response.tool_calls[1].id, "");
        assert_eq!(response.tool_calls[1].name, "second");
        assert_eq!(response.tool_calls[1].arguments, "{\"x\":2}");
    }

    #[test]
    fn orphan_continuation_is_dropped() {
        let mut acc = StreamAccumulator::new();
        let forwarded = acc.process(&ChatChunk::tool_call_arguments("{\"lost\":true}"));

        assert!(forwarded.is_empty());
        assert!(acc.finish().tool_calls.is_empty());
    }

    #[test]
    fn usage_only_chunk_overwrites_snapshot() {
        let mut acc = StreamAccumulator::new();
        acc.process(&ChatChunk::usage(Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
        }));
        acc.process(&ChatChunk::usage(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }));

        assert_eq!(
            acc.finish().usage,
            Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            })
        );
    }
}
