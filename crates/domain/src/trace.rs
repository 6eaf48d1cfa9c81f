use serde::{Deserialize, Serialize};

/// Structured control-flow events emitted by the kernel.
///
/// These are the payloads fanned out on the event bus, buffered in the
/// per-session ring for `brain.step.stream`, and logged via [`emit`].
/// The `event` tag values are a stable contract with stream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    #[serde(rename = "loop_start")]
    LoopStart { session_id: String },
    #[serde(rename = "loop_done")]
    LoopDone { session_id: String, status: String },

    #[serde(rename = "llm.request")]
    LlmRequest {
        session_id: String,
        profile: String,
        model: String,
        message_count: usize,
        char_count: usize,
        /// Trimmed tail of the last user message; never the full payload.
        last_user_snippet: String,
    },

    #[serde(rename = "llm.route.selected")]
    LlmRouteSelected {
        session_id: String,
        profile: String,
        provider: String,
        model: String,
        source: String,
        role: Option<String>,
        ordered_profiles: Vec<String>,
    },
    #[serde(rename = "llm.route.escalated")]
    LlmRouteEscalated {
        session_id: String,
        from_profile: String,
        to_profile: String,
        reason: String,
    },
    #[serde(rename = "llm.route.blocked")]
    LlmRouteBlocked {
        session_id: String,
        reason: String,
    },

    #[serde(rename = "auto_retry_start")]
    AutoRetryStart {
        session_id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },

    #[serde(rename = "auto_compaction_start")]
    AutoCompactionStart {
        session_id: String,
        reason: String,
    },
    #[serde(rename = "auto_compaction_end")]
    AutoCompactionEnd {
        session_id: String,
        tokens_before: u64,
        tokens_after: u64,
    },
    #[serde(rename = "session_compact")]
    SessionCompact {
        session_id: String,
        first_kept_entry_id: String,
    },

    #[serde(rename = "step_execute")]
    StepExecute {
        session_id: String,
        action: String,
        capability: Option<String>,
        mode: Option<String>,
    },
    #[serde(rename = "step_execute_result")]
    StepExecuteResult {
        session_id: String,
        action: String,
        ok: bool,
        mode_used: Option<String>,
        fallback_from: Option<String>,
        error_code: Option<String>,
    },

    #[serde(rename = "bridge.status")]
    BridgeStatus { status: String },

    #[serde(rename = "invoke.started")]
    InvokeStarted {
        invoke_id: String,
        session_id: String,
        tool: String,
    },
    #[serde(rename = "invoke.stderr")]
    InvokeStderr {
        invoke_id: String,
        session_id: String,
        source: String,
        message: String,
    },
    #[serde(rename = "invoke.finished")]
    InvokeFinished {
        invoke_id: String,
        session_id: String,
        ok: bool,
    },
}

impl TraceEvent {
    /// The wire name of this event (the serde tag).
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::LoopStart { .. } => "loop_start",
            TraceEvent::LoopDone { .. } => "loop_done",
            TraceEvent::LlmRequest { .. } => "llm.request",
            TraceEvent::LlmRouteSelected { .. } => "llm.route.selected",
            TraceEvent::LlmRouteEscalated { .. } => "llm.route.escalated",
            TraceEvent::LlmRouteBlocked { .. } => "llm.route.blocked",
            TraceEvent::AutoRetryStart { .. } => "auto_retry_start",
            TraceEvent::AutoCompactionStart { .. } => "auto_compaction_start",
            TraceEvent::AutoCompactionEnd { .. } => "auto_compaction_end",
            TraceEvent::SessionCompact { .. } => "session_compact",
            TraceEvent::StepExecute { .. } => "step_execute",
            TraceEvent::StepExecuteResult { .. } => "step_execute_result",
            TraceEvent::BridgeStatus { .. } => "bridge.status",
            TraceEvent::InvokeStarted { .. } => "invoke.started",
            TraceEvent::InvokeStderr { .. } => "invoke.stderr",
            TraceEvent::InvokeFinished { .. } => "invoke.finished",
        }
    }

    /// Session this event belongs to, when it has one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            TraceEvent::LoopStart { session_id }
            | TraceEvent::LoopDone { session_id, .. }
            | TraceEvent::LlmRequest { session_id, .. }
            | TraceEvent::LlmRouteSelected { session_id, .. }
            | TraceEvent::LlmRouteEscalated { session_id, .. }
            | TraceEvent::LlmRouteBlocked { session_id, .. }
            | TraceEvent::AutoRetryStart { session_id, .. }
            | TraceEvent::AutoCompactionStart { session_id, .. }
            | TraceEvent::AutoCompactionEnd { session_id, .. }
            | TraceEvent::SessionCompact { session_id, .. }
            | TraceEvent::StepExecute { session_id, .. }
            | TraceEvent::StepExecuteResult { session_id, .. }
            | TraceEvent::InvokeStarted { session_id, .. }
            | TraceEvent::InvokeStderr { session_id, .. }
            | TraceEvent::InvokeFinished { session_id, .. } => Some(session_id),
            TraceEvent::BridgeStatus { .. } => None,
        }
    }

    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sk_event");
    }
}
