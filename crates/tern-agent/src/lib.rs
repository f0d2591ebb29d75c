//! Agent execution core.
//!
//! Drives the step loop that calls a model, repairs and validates the tool
//! calls it asks for, runs them, and feeds the results back until the task
//! finishes, fails, or is interrupted. Background subagents run the same
//! loop in isolation without blocking the caller.

pub mod approval;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod guard;
pub mod repair;
pub mod state;
pub mod subagents;
pub mod tools;
pub mod validator;
pub mod wire;

pub use approval::*;
pub use config::*;
pub use context::*;
pub use engine::*;
pub use errors::*;
pub use executor::*;
pub use guard::*;
pub use repair::*;
pub use state::*;
pub use subagents::*;
pub use tools::*;
pub use validator::*;
pub use wire::*;
