//! Model-backed stage invoker with a bounded tool-use loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use cadence_llm::{Message, ProviderAdapter, Request, ToolCallResult, ToolDefinition};
use cadence_tools::{truncate_output, ToolRegistry, TruncationMode};
use cadence_types::{CadenceError, Result};

use crate::invoker::{StageInvoker, StageRequest};

use super::render_prompt;

/// Characters of tool output fed back to the model per call.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 30_000;

#[derive(Debug, Clone)]
pub struct ModelInvokerConfig {
    /// Model identifier; the provider's default when `None`.
    pub model: Option<String>,
    pub system_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Maximum model round trips per invocation.
    pub max_tool_rounds: usize,
    pub max_tool_output_chars: usize,
}

impl Default for ModelInvokerConfig {
    fn default() -> Self {
        Self {
            model: None,
            system_prompt: "You are a senior product marketing strategist. \
                            Respond with the requested deliverable only."
                .to_string(),
            max_tokens: Some(4096),
            temperature: None,
            max_tool_rounds: 8,
            max_tool_output_chars: MAX_TOOL_OUTPUT_CHARS,
        }
    }
}

/// Invokes a stage by prompting a chat model, running any tools it asks for
/// from the stage's permitted set.
pub struct ModelInvoker {
    provider: Arc<dyn ProviderAdapter>,
    tools: ToolRegistry,
    config: ModelInvokerConfig,
}

impl ModelInvoker {
    pub fn new(provider: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            provider,
            tools: ToolRegistry::new(),
            config: ModelInvokerConfig::default(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: ModelInvokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ModelInvokerConfig {
        &self.config
    }

    /// Definitions for the stage's tools that are actually registered.
    fn offered_tools(&self, request: &StageRequest) -> Result<Vec<ToolDefinition>> {
        let available: Vec<&str> = request
            .tools
            .iter()
            .map(String::as_str)
            .filter(|name| {
                let known = self.tools.contains(name);
                if !known {
                    tracing::warn!(stage = %request.stage, tool = %name, "Tool not registered, continuing without it");
                }
                known
            })
            .collect();
        Ok(self
            .tools
            .definitions_for(&available)?
            .into_iter()
            .map(|d| ToolDefinition {
                name: d.name,
                description: d.description,
                parameters: d.parameters,
            })
            .collect())
    }

    async fn run_tool_calls(&self, request: &StageRequest, calls: &[ToolCallResult]) -> Vec<Message> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            tracing::debug!(stage = %request.stage, tool = %call.name, id = %call.id, "Executing tool call");
            let permitted = request.tools.iter().any(|t| t == &call.name);
            let (content, is_error) = match self.tools.get(&call.name) {
                Some(tool) if permitted => match tool.execute(call.arguments.clone()).await {
                    Ok(output) => (
                        truncate_output(&output, self.config.max_tool_output_chars, TruncationMode::HeadTail),
                        false,
                    ),
                    Err(e) => {
                        tracing::debug!(tool = %call.name, error = %e, "Tool execution failed");
                        (format!("Error: {e}"), true)
                    }
                },
                _ => (
                    format!("Error: tool '{}' is not available to this stage", call.name),
                    true,
                ),
            };
            results.push(Message::tool_result(&call.id, content, is_error));
        }
        results
    }
}

#[async_trait]
impl StageInvoker for ModelInvoker {
    async fn invoke(&self, request: &StageRequest) -> Result<Value> {
        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string());

        let mut messages = Vec::new();
        if !self.config.system_prompt.is_empty() {
            messages.push(Message::system(&self.config.system_prompt));
        }
        messages.push(Message::user(render_prompt(&request.instruction, &request.inputs)));
        let tools = self.offered_tools(request)?;

        for round in 0..self.config.max_tool_rounds {
            let llm_request = Request {
                model: model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                stop_sequences: Vec::new(),
            };

            let response = self.provider.complete(&llm_request).await?;
            tracing::info!(
                stage = %request.stage,
                round,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                finish_reason = ?response.finish_reason,
                tool_calls = response.tool_calls.len(),
                "Model response received"
            );

            if response.tool_calls.is_empty() {
                if response.text.trim().is_empty() {
                    return Err(CadenceError::StageInvocation {
                        stage: request.stage.clone(),
                        message: "model returned an empty completion".into(),
                    });
                }
                return Ok(Value::String(response.text));
            }

            messages.push(Message::assistant_with_tool_calls(&response.text, &response.tool_calls));
            messages.extend(self.run_tool_calls(request, &response.tool_calls).await);
        }

        Err(CadenceError::StageInvocation {
            stage: request.stage.clone(),
            message: format!(
                "model was still calling tools after {} rounds",
                self.config.max_tool_rounds
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_llm::{ContentPart, FinishReason, Response, Role, Usage};
    use cadence_tools::Tool;
    use cadence_types::SharedState;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays canned responses and records every request it receives.
    struct ScriptedProvider {
        responses: Mutex<Vec<Response>>,
        requests: Mutex<Vec<Request>>,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<Response>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        async fn complete(&self, request: &Request) -> Result<Response> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| CadenceError::Other("script exhausted".into()))
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-model"
        }
    }

    fn text(body: &str) -> Response {
        Response {
            id: "r".into(),
            text: body.into(),
            tool_calls: vec![],
            usage: Usage::default(),
            model: "scripted-model".into(),
            finish_reason: FinishReason::EndTurn,
        }
    }

    fn tool_call(name: &str) -> Response {
        Response {
            id: "r".into(),
            text: String::new(),
            tool_calls: vec![ToolCallResult {
                id: "call_1".into(),
                name: name.into(),
                arguments: json!({"query": "smart kettles"}),
            }],
            usage: Usage::default(),
            model: "scripted-model".into(),
            finish_reason: FinishReason::ToolUse,
        }
    }

    struct Search;

    #[async_trait]
    impl Tool for Search {
        fn definition(&self) -> cadence_tools::ToolDefinition {
            cadence_tools::ToolDefinition {
                name: "web_search".into(),
                description: "Search the web".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, arguments: Value) -> Result<String> {
            Ok(format!("3 results for {}", arguments["query"].as_str().unwrap_or_default()))
        }
    }

    fn stage_request(tools: &[&str]) -> StageRequest {
        StageRequest {
            stage: "research".into(),
            instruction: "Research the market.".into(),
            inputs: SharedState::seeded("topic", "smart kettle"),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            attempt: 0,
        }
    }

    fn tool_result_parts(req: &Request) -> Vec<(String, bool)> {
        req.messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .flat_map(|m| m.content.iter())
            .filter_map(|p| match p {
                ContentPart::ToolResult {
                    content, is_error, ..
                } => Some((content.clone(), *is_error)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_completion_becomes_output() {
        let provider = ScriptedProvider::new(vec![text("Kettles are booming.")]);
        let invoker = ModelInvoker::new(provider.clone());

        let out = invoker.invoke(&stage_request(&[])).await.unwrap();
        assert_eq!(out, json!("Kettles are booming."));

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "scripted-model");
        assert_eq!(requests[0].messages[0].role, Role::System);
        match &requests[0].messages[1].content[0] {
            ContentPart::Text { text } => assert!(text.contains("## topic\nsmart kettle")),
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let provider = ScriptedProvider::new(vec![tool_call("web_search"), text("Report.")]);
        let mut tools = ToolRegistry::new();
        tools.register(Search);
        let invoker = ModelInvoker::new(provider.clone()).with_tools(tools);

        let out = invoker.invoke(&stage_request(&["web_search"])).await.unwrap();
        assert_eq!(out, json!("Report."));

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        let results = tool_result_parts(&requests[1]);
        assert_eq!(results, vec![("3 results for smart kettles".to_string(), false)]);
    }

    #[tokio::test]
    async fn tools_outside_stage_permission_are_refused() {
        let provider = ScriptedProvider::new(vec![tool_call("web_search"), text("Report.")]);
        let mut tools = ToolRegistry::new();
        tools.register(Search);
        let invoker = ModelInvoker::new(provider.clone()).with_tools(tools);

        invoker.invoke(&stage_request(&[])).await.unwrap();

        let requests = provider.requests.lock().unwrap();
        assert!(requests[0].tools.is_empty());
        let results = tool_result_parts(&requests[1]);
        assert!(results[0].1);
        assert!(results[0].0.contains("not available"));
    }

    #[tokio::test]
    async fn unregistered_stage_tools_are_skipped() {
        let provider = ScriptedProvider::new(vec![text("Report.")]);
        let invoker = ModelInvoker::new(provider.clone());

        invoker.invoke(&stage_request(&["web_search"])).await.unwrap();
        assert!(provider.requests.lock().unwrap()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn empty_completion_is_an_invocation_failure() {
        let provider = ScriptedProvider::new(vec![text("   ")]);
        let err = ModelInvoker::new(provider)
            .invoke(&stage_request(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::StageInvocation { .. }));
    }

    #[tokio::test]
    async fn tool_rounds_are_bounded() {
        let provider = ScriptedProvider::new(vec![
            tool_call("web_search"),
            tool_call("web_search"),
            tool_call("web_search"),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(Search);
        let invoker = ModelInvoker::new(provider.clone())
            .with_tools(tools)
            .with_config(ModelInvokerConfig {
                max_tool_rounds: 2,
                ..ModelInvokerConfig::default()
            });

        let err = invoker.invoke(&stage_request(&["web_search"])).await.unwrap_err();
        assert!(err.to_string().contains("after 2 rounds"));
        assert_eq!(provider.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn provider_errors_propagate_unchanged() {
        let provider = ScriptedProvider::new(vec![]);
        let err = ModelInvoker::new(provider)
            .invoke(&stage_request(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::Other(_)));
    }
}
