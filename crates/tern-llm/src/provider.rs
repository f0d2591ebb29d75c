//! Model transport contract.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::LlmError;
use crate::types::{ChatChunk, Message, ToolDefinition};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

/// Opens a streamed completion against a language model.
///
/// Implementations own model selection, authentication and wire format; the
/// agent core only sees the chunk stream.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn generate_stream(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError>;
}

/// Wraps a pre-built chunk list as a stream.
pub fn chunk_stream(chunks: Vec<Result<ChatChunk, LlmError>>) -> ChunkStream {
    Box::pin(futures::stream::iter(chunks))
}
