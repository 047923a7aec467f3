//! Tool trait, tool registry, and output truncation for Cadence stages.
//!
//! Stages only name the tools they may consult. The registry resolves those
//! names to callable capabilities (a web search, a lookup service, ...) when a
//! model-backed invoker needs them.

pub mod tool;
pub mod truncation;

pub use tool::{Tool, ToolDefinition, ToolRegistry};
pub use truncation::{truncate_output, TruncationMode};
