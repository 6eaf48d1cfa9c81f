use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use sk_domain::error::{Error, ErrorCode};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution modes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A concrete execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Injected page script.
    Script,
    /// Chrome DevTools Protocol.
    Cdp,
    /// Local tool-execution server over WebSocket.
    Bridge,
    /// Anything a plugin brings along.
    Custom,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Script => "script",
            Mode::Cdp => "cdp",
            Mode::Bridge => "bridge",
            Mode::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "script" => Some(Mode::Script),
            "cdp" => Some(Mode::Cdp),
            "bridge" => Some(Mode::Bridge),
            "custom" => Some(Mode::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a provider's `invoke` receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInput {
    pub session_id: String,
    pub action: String,
    pub args: serde_json::Value,
    /// Stable id for transports that dedup retries (the bridge).
    /// Absent for one-shot invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<String>,
}

pub type InvokeFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, Error>> + Send>>;
pub type InvokeFn = Arc<dyn Fn(CapabilityInput) -> InvokeFuture + Send + Sync>;
pub type CanHandleFn = Arc<dyn Fn(&CapabilityInput) -> bool + Send + Sync>;

/// A registered capability (or mode-lane) provider.
///
/// Providers implement a narrow operation set: an optional `can_handle`
/// predicate and `invoke`. No inheritance; resolution is explicit
/// iteration over these records.
#[derive(Clone)]
pub struct ProviderRecord {
    pub capability: String,
    pub id: String,
    pub mode: Mode,
    /// Higher priority wins; ties resolve in registration order.
    pub priority: i32,
    pub can_handle: Option<CanHandleFn>,
    pub invoke: InvokeFn,
    pub plugin_id: Option<String>,
}

impl ProviderRecord {
    pub fn accepts(&self, input: &CapabilityInput) -> bool {
        self.can_handle.as_ref().map_or(true, |f| f(input))
    }
}

impl std::fmt::Debug for ProviderRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRecord")
            .field("capability", &self.capability)
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("priority", &self.priority)
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Attributed errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A capability failure annotated with where it happened, so callers
/// can always attribute a failure to a lane and a verb.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct CapabilityError {
    pub error: Error,
    pub mode_used: Option<Mode>,
    pub capability_used: Option<String>,
}

impl CapabilityError {
    pub fn new(error: Error) -> Self {
        Self {
            error,
            mode_used: None,
            capability_used: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode_used = Some(mode);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability_used = Some(capability.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }
}
