use sk_domain::tool::{Message, ToolCall, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Endpoint coordinates resolved from an LLM profile, carried per
/// request so one adapter instance serves every profile of its kind.
#[derive(Debug, Clone, Default)]
pub struct RouteTarget {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub request_timeout_ms: u64,
}

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send (already stitched).
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model override on top of the target's model.
    pub model: Option<String>,
    /// Where to send the request. Required by HTTP adapters; test
    /// doubles may ignore it.
    pub target: Option<RouteTarget>,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content of the response.
    pub content: String,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage information.
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    /// The reason the model stopped (e.g. "stop", "tool_calls").
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classified failure from a chat call. The kind drives the kernel's
/// retry / compact / escalate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorKind {
    /// The model reported a context-length overflow. Never retried;
    /// always answered with compaction.
    Overflow,
    /// Authentication / authorization rejection.
    Auth,
    /// Transient transport failure (connect error, 5xx, disconnect).
    Transport,
    /// The request timed out.
    Timeout,
    /// Rate limited by the provider.
    RateLimited,
    /// Any other API-level rejection.
    Api,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("provider {provider}: {message}")]
pub struct ChatError {
    pub provider: String,
    pub kind: ChatErrorKind,
    pub message: String,
    pub status: Option<u16>,
}

impl ChatError {
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            ChatErrorKind::Transport | ChatErrorKind::Timeout | ChatErrorKind::RateLimited
        )
    }

    pub fn is_overflow(&self) -> bool {
        self.kind == ChatErrorKind::Overflow
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter must implement.
///
/// Implementations translate between the internal types and a concrete
/// chat-completions-compatible HTTP API.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ChatError>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;

    /// Optional hook for adapters that rewrite the endpoint per request.
    fn resolve_request_url(&self, base: &str, _model: &str) -> String {
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}
