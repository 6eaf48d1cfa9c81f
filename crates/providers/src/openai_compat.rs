//! OpenAI-compatible adapter.
//!
//! Works with any endpoint following the chat completions contract
//! (OpenAI, Ollama, vLLM, LM Studio, OpenRouter, …). One adapter
//! instance serves every profile of this kind: each request carries its
//! resolved [`RouteTarget`] (base URL, key, model, timeout).

use std::time::Duration;

use serde_json::Value;

use sk_domain::tool::{Message, Role, ToolCall, ToolDefinition};

use crate::traits::{ChatError, ChatErrorKind, ChatRequest, ChatResponse, LlmProvider, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client: reqwest::Client::new(),
        }
    }

    fn err(&self, kind: ChatErrorKind, message: impl Into<String>, status: Option<u16>) -> ChatError {
        ChatError {
            provider: self.id.clone(),
            kind,
            message: message.into(),
            status,
        }
    }

    fn build_body(req: &ChatRequest, model: &str) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }

    fn classify_status(&self, status: u16, body_text: &str) -> ChatError {
        let kind = if status == 401 || status == 403 {
            ChatErrorKind::Auth
        } else if status == 429 {
            ChatErrorKind::RateLimited
        } else if status >= 500 {
            ChatErrorKind::Transport
        } else if looks_like_overflow(body_text) {
            ChatErrorKind::Overflow
        } else {
            ChatErrorKind::Api
        };
        self.err(kind, trim_body(body_text), Some(status))
    }
}

/// Context-length rejections are not standardized; match the phrasings
/// the common gateways actually produce.
fn looks_like_overflow(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context length")
        || lower.contains("context_length")
        || lower.contains("maximum context")
        || lower.contains("context window")
        || lower.contains("too many tokens")
}

fn trim_body(body: &str) -> String {
    body.chars().take(500).collect()
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let target = req.target.as_ref().ok_or_else(|| {
            self.err(
                ChatErrorKind::Api,
                "chat request carries no route target",
                None,
            )
        })?;
        let model = req.model.clone().unwrap_or_else(|| target.model.clone());
        let url = self.resolve_request_url(&target.api_base, &model);
        let body = Self::build_body(req, &model);

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(target.request_timeout_ms.max(1)))
            .header("Authorization", format!("Bearer {}", target.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    ChatErrorKind::Timeout
                } else {
                    ChatErrorKind::Transport
                };
                self.err(kind, e.to_string(), None)
            })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            self.err(
                ChatErrorKind::Transport,
                format!("reading response body: {e}"),
                Some(status),
            )
        })?;

        if !(200..300).contains(&status) {
            return Err(self.classify_status(status, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| {
            self.err(
                ChatErrorKind::Api,
                format!("malformed response JSON: {e}"),
                Some(status),
            )
        })?;

        parse_chat_response(&self.id, &json)
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire conversion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_wire(msg: &Message) -> Value {
    let mut obj = serde_json::json!({
        "role": role_to_str(msg.role),
        "content": msg.content,
    });
    if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.call_id,
                    "type": "function",
                    "function": {
                        "name": tc.tool_name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        obj["tool_calls"] = Value::Array(calls);
        if msg.content.is_empty() {
            obj["content"] = Value::Null;
        }
    }
    if msg.role == Role::Tool {
        if let Some(id) = &msg.tool_call_id {
            obj["tool_call_id"] = Value::String(id.clone());
        }
    }
    obj
}

fn tool_to_wire(def: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters,
        }
    })
}

fn parse_chat_response(provider: &str, json: &Value) -> Result<ChatResponse, ChatError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ChatError {
            provider: provider.to_owned(),
            kind: ChatErrorKind::Api,
            message: "response has no choices".into(),
            status: None,
        })?;

    let message = choice.get("message").cloned().unwrap_or(Value::Null);
    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_owned();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        for call in calls {
            let call_id = call
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            let function = call.get("function").cloned().unwrap_or(Value::Null);
            let tool_name = function
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            let raw_args = function
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or("{}");
            let arguments = serde_json::from_str(raw_args).unwrap_or_else(|e| {
                tracing::warn!(
                    call_id = %call_id,
                    tool = %tool_name,
                    error = %e,
                    "tool call arguments are not valid JSON; defaulting to empty object"
                );
                Value::Object(Default::default())
            });
            tool_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }
    }

    let usage = json.get("usage").map(|u| Usage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        completion_tokens: u
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
    });

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_owned(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(ToOwned::to_owned),
    })
}
