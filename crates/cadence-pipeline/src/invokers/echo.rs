use async_trait::async_trait;
use serde_json::Value;

use cadence_types::Result;

use crate::invoker::{StageInvoker, StageRequest};

use super::render_prompt;

/// Deterministic dry-run invoker: returns the prompt it would have sent.
///
/// Useful for checking a pipeline's wiring without calling a model.
#[derive(Debug, Clone, Default)]
pub struct EchoInvoker;

#[async_trait]
impl StageInvoker for EchoInvoker {
    async fn invoke(&self, request: &StageRequest) -> Result<Value> {
        tracing::debug!(stage = %request.stage, attempt = request.attempt, "Dry run invocation");
        let mut text = format!("[dry run] stage '{}'", request.stage);
        if !request.tools.is_empty() {
            text.push_str(&format!(" (tools: {})", request.tools.join(", ")));
        }
        text.push_str("\n\n");
        text.push_str(&render_prompt(&request.instruction, &request.inputs));
        Ok(Value::String(text))
    }
}
