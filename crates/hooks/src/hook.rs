use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The closed set of hook points the kernel fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookName {
    #[serde(rename = "tool.before_call")]
    ToolBeforeCall,
    #[serde(rename = "tool.after_result")]
    ToolAfterResult,
    #[serde(rename = "llm.before_request")]
    LlmBeforeRequest,
    #[serde(rename = "llm.after_response")]
    LlmAfterResponse,
    #[serde(rename = "compaction.check.before")]
    CompactionCheckBefore,
    #[serde(rename = "compaction.summary")]
    CompactionSummary,
    #[serde(rename = "agent_end.after")]
    AgentEndAfter,
    #[serde(rename = "loop.before_iteration")]
    LoopBeforeIteration,
    #[serde(rename = "loop.done")]
    LoopDone,
}

impl HookName {
    pub const ALL: [HookName; 9] = [
        HookName::ToolBeforeCall,
        HookName::ToolAfterResult,
        HookName::LlmBeforeRequest,
        HookName::LlmAfterResponse,
        HookName::CompactionCheckBefore,
        HookName::CompactionSummary,
        HookName::AgentEndAfter,
        HookName::LoopBeforeIteration,
        HookName::LoopDone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HookName::ToolBeforeCall => "tool.before_call",
            HookName::ToolAfterResult => "tool.after_result",
            HookName::LlmBeforeRequest => "llm.before_request",
            HookName::LlmAfterResponse => "llm.after_response",
            HookName::CompactionCheckBefore => "compaction.check.before",
            HookName::CompactionSummary => "compaction.summary",
            HookName::AgentEndAfter => "agent_end.after",
            HookName::LoopBeforeIteration => "loop.before_iteration",
            HookName::LoopDone => "loop.done",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|h| h.as_str() == name)
    }
}

impl std::fmt::Display for HookName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict returned by a hook handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum HookVerdict {
    /// Proceed unchanged.
    Continue,
    /// Proceed with `patch` shallow-merged into the event envelope.
    Patch { patch: serde_json::Value },
    /// Abort the operation.
    Block { reason: String },
}

impl HookVerdict {
    pub fn is_blocking(&self) -> bool {
        matches!(self, HookVerdict::Block { .. })
    }
}

pub type HookFuture = Pin<Box<dyn Future<Output = HookVerdict> + Send>>;
pub type HookFn = Arc<dyn Fn(serde_json::Value) -> HookFuture + Send + Sync>;

/// A registered handler. Scoped by `(plugin_id, id)`: two plugins may
/// reuse the same user-provided id without colliding.
#[derive(Clone)]
pub struct HookHandler {
    pub hook: HookName,
    pub id: String,
    pub plugin_id: String,
    pub timeout_ms: u64,
    pub handler: HookFn,
}

impl HookHandler {
    pub fn new(
        hook: HookName,
        plugin_id: impl Into<String>,
        id: impl Into<String>,
        handler: HookFn,
    ) -> Self {
        Self {
            hook,
            id: id.into(),
            plugin_id: plugin_id.into(),
            timeout_ms: 10_000,
            handler,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

impl std::fmt::Debug for HookHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookHandler")
            .field("hook", &self.hook)
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}
