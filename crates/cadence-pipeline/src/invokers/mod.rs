//! Built-in stage invokers.

pub mod echo;
pub mod model;

pub use echo::EchoInvoker;
pub use model::{ModelInvoker, ModelInvokerConfig};

use cadence_types::SharedState;

/// Instruction followed by each input as a labelled section, in state order.
pub fn render_prompt(instruction: &str, inputs: &SharedState) -> String {
    let mut prompt = instruction.trim_end().to_string();
    for (key, value) in inputs.iter() {
        let body = match value {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        prompt.push_str(&format!("\n\n## {key}\n{body}"));
    }
    prompt
}
