//! LLM provider adapters, registry, and route resolution.

pub mod openai_compat;
pub mod registry;
pub mod retry;
pub mod route;
pub mod traits;

pub use openai_compat::OpenAiCompatProvider;
pub use registry::ProviderRegistry;
pub use route::{decide_profile_escalation, resolve_route, EscalationDecision, ResolvedRoute, RouteError, RouteRequest, RouteSource};
pub use retry::RetryBackoff;
pub use traits::{ChatError, ChatErrorKind, ChatRequest, ChatResponse, LlmProvider, RouteTarget, Usage};
