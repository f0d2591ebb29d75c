//! Model-side vocabulary for the tern agent core.
//!
//! Conversation messages, tool definitions, the chunked streaming shape a
//! model transport produces, and the accumulator that folds those chunks
//! back into one response.

pub mod errors;
pub mod provider;
pub mod types;
pub mod utils;

pub use errors::*;
pub use provider::*;
pub use types::*;
pub use utils::stream_accumulator::{AccumulatedResponse, StreamAccumulator, StreamFragment};
