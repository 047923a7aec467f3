use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    ContentPart, FinishReason, Message, ProviderAdapter, Request, Response, Role, ToolCallResult,
    ToolDefinition, Usage,
};
use cadence_types::{CadenceError, Result};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// AnthropicAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build an adapter from `ANTHROPIC_API_KEY`, honouring an optional
    /// `ANTHROPIC_BASE_URL` override.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| CadenceError::AuthError {
            provider: PROVIDER.into(),
        })?;
        let adapter = Self::new(key);
        Ok(match std::env::var("ANTHROPIC_BASE_URL") {
            Ok(url) if !url.is_empty() => adapter.with_base_url(url),
            _ => adapter,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> CadenceError {
        if err.is_timeout() {
            CadenceError::RequestTimeout {
                provider: PROVIDER.into(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            CadenceError::ProviderError {
                provider: PROVIDER.into(),
                status: 0,
                message: err.to_string(),
                retryable: true,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request translation
// ---------------------------------------------------------------------------

fn build_request_body(request: &Request) -> Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .flat_map(|m| {
            m.content.iter().filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": convert_messages(&request.messages),
    });

    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    if !request.tools.is_empty() {
        body["tools"] = request.tools.iter().map(convert_tool_definition).collect();
    }
    if !request.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(request.stop_sequences);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }

    body
}

/// Converts non-system messages. Tool results travel as `user` turns and are
/// folded into a directly preceding `user` turn when there is one.
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => continue,
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        };
        let content = convert_content_parts(&msg.content);

        if msg.role == Role::Tool {
            if let Some(last) = out.last_mut() {
                if last["role"] == "user" {
                    if let Some(arr) = last["content"].as_array_mut() {
                        arr.extend(content);
                        continue;
                    }
                }
            }
        }
        out.push(json!({ "role": role, "content": content }));
    }

    out
}

fn convert_content_parts(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .map(|p| match p {
            ContentPart::Text { text } => json!({ "type": "text", "text": text }),
            ContentPart::ToolCall {
                id,
                name,
                arguments,
            } => json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": arguments
            }),
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
            } => {
                let mut v = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content
                });
                if *is_error {
                    v["is_error"] = json!(true);
                }
                v
            }
        })
        .collect()
}

fn convert_tool_definition(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters
    })
}

// ---------------------------------------------------------------------------
// Response translation
// ---------------------------------------------------------------------------

fn parse_response(body: &Value) -> Result<Response> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| CadenceError::ProviderError {
            provider: PROVIDER.into(),
            status: 200,
            message: "response has no content array".into(),
            retryable: false,
        })?;

    let finish_reason = match body["stop_reason"].as_str() {
        Some("max_tokens") => FinishReason::MaxTokens,
        Some("stop_sequence") => FinishReason::StopSequence,
        Some("tool_use") => FinishReason::ToolUse,
        _ => FinishReason::EndTurn,
    };

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCallResult {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    let input_tokens = body["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = body["usage"]["output_tokens"].as_u64().unwrap_or(0);

    Ok(Response {
        id: body["id"].as_str().unwrap_or_default().to_string(),
        text,
        tool_calls,
        usage: Usage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        },
        model: body["model"].as_str().unwrap_or_default().to_string(),
        finish_reason,
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(status: reqwest::StatusCode, body: &str) -> CadenceError {
    let code = status.as_u16();
    match code {
        429 => {
            let retry_after_ms = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["error"]["retry_after"].as_f64())
                .map(|s| (s * 1000.0) as u64)
                .unwrap_or(1000);
            CadenceError::RateLimited {
                provider: PROVIDER.into(),
                retry_after_ms,
            }
        }
        401 | 403 => CadenceError::AuthError {
            provider: PROVIDER.into(),
        },
        _ => CadenceError::ProviderError {
            provider: PROVIDER.into(),
            status: code,
            message: extract_error_message(body),
            retryable: matches!(code, 500 | 502 | 503 | 529),
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn complete(&self, request: &Request) -> Result<Response> {
        let body = build_request_body(request);
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending completion request"
        );

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .timeout(self.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let err = map_error(status, &text);
            tracing::warn!(status = status.as_u16(), error = %err, "Provider request failed");
            return Err(err);
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| CadenceError::ProviderError {
            provider: PROVIDER.into(),
            status: status.as_u16(),
            message: format!("Failed to parse response JSON: {e}"),
            retryable: false,
        })?;

        parse_response(&json)
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        "claude-sonnet-4-5-20250929"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_request() -> Request {
        let mut req = Request::new(
            "claude-sonnet-4-5-20250929",
            vec![
                Message::system("You are a market researcher."),
                Message::user("Research fitness trackers"),
            ],
        );
        req.max_tokens = Some(1024);
        req
    }

    #[test]
    fn system_messages_become_top_level_field() {
        let body = build_request_body(&basic_request());
        assert_eq!(body["system"], "You are a market researcher.");
        assert_eq!(body["max_tokens"], 1024);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"][0]["text"], "Research fitness trackers");
    }

    #[test]
    fn default_max_tokens_applied() {
        let req = Request::new("m", vec![Message::user("hi")]);
        let body = build_request_body(&req);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert!(body.get("system").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn tools_and_tool_calls_are_converted() {
        let mut req = basic_request();
        req.messages.push(Message::assistant_with_tool_calls(
            "",
            &[ToolCallResult {
                id: "tc_1".into(),
                name: "web_search".into(),
                arguments: json!({"query": "wearables"}),
            }],
        ));
        req.tools = vec![ToolDefinition {
            name: "web_search".into(),
            description: "Search the web".into(),
            parameters: json!({"type": "object"}),
        }];

        let body = build_request_body(&req);
        let assistant = &body["messages"][1];
        assert_eq!(assistant["role"], "assistant");
        assert_eq!(assistant["content"][0]["type"], "tool_use");
        assert_eq!(assistant["content"][0]["input"]["query"], "wearables");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn consecutive_tool_results_share_one_user_turn() {
        let messages = vec![
            Message::user("go"),
            Message::assistant("calling"),
            Message::tool_result("tc_1", "first", false),
            Message::tool_result("tc_2", "second", true),
        ];
        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 3);
        let content = converted[2]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["tool_use_id"], "tc_1");
        assert_eq!(content[1]["is_error"], true);
    }

    #[test]
    fn parse_response_handles_text_and_tool_use() {
        let body = json!({
            "id": "msg_123",
            "model": "claude-sonnet-4-5-20250929",
            "content": [
                {"type": "text", "text": "Let me search."},
                {"type": "tool_use", "id": "tc_1", "name": "web_search", "input": {"query": "rust"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 100, "output_tokens": 50}
        });

        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.id, "msg_123");
        assert_eq!(resp.text, "Let me search.");
        assert_eq!(resp.finish_reason, FinishReason::ToolUse);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "web_search");
        assert_eq!(resp.usage.total_tokens, 150);
    }

    #[test]
    fn parse_response_without_content_is_an_error() {
        let err = parse_response(&json!({"id": "x"})).unwrap_err();
        assert!(matches!(err, CadenceError::ProviderError { retryable: false, .. }));
    }

    #[test]
    fn error_mapping_429_rate_limited() {
        let err = map_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "slow down", "retry_after": 2.5}}"#,
        );
        assert!(matches!(err, CadenceError::RateLimited { retry_after_ms: 2500, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn error_mapping_401_is_terminal() {
        let err = map_error(
            reqwest::StatusCode::UNAUTHORIZED,
            r#"{"error": {"message": "invalid api key"}}"#,
        );
        assert!(matches!(err, CadenceError::AuthError { .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn error_mapping_by_status() {
        let bad = map_error(reqwest::StatusCode::BAD_REQUEST, r#"{"error": {"message": "bad"}}"#);
        match &bad {
            CadenceError::ProviderError {
                retryable,
                status,
                message,
                ..
            } => {
                assert!(!retryable);
                assert_eq!(*status, 400);
                assert_eq!(message, "bad");
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }

        let overloaded = map_error(reqwest::StatusCode::from_u16(529).unwrap(), "overloaded");
        assert!(overloaded.is_retryable());
    }

    #[test]
    fn adapter_identity() {
        let adapter = AnthropicAdapter::new("test-key").with_base_url("http://localhost:9");
        assert_eq!(adapter.name(), "anthropic");
        assert_eq!(adapter.base_url, "http://localhost:9");
        assert_eq!(adapter.timeout, DEFAULT_TIMEOUT);
    }
}
