//! The per-session run loop.
//!
//! One loop owns a session at a time. Each iteration: pre-send
//! compaction check → route resolution → hook-wrapped LLM call → tool
//! dispatch → decision. Stop is observed at the iteration boundary and
//! after every await point that matters; the `running` flag drops only
//! when the loop exits cleanly, so a `start` during shutdown can never
//! spawn a second loop.

use serde::Deserialize;
use serde_json::Value;

use sk_domain::config::{Config, EscalationPolicy, LlmProfile};
use sk_domain::error::{Error, Result};
use sk_domain::tool::{Message, Role, ToolCall};
use sk_domain::trace::TraceEvent;
use sk_hooks::{run_chain, HookName};
use sk_providers::{
    decide_profile_escalation, resolve_route, ChatError, ChatRequest, EscalationDecision,
    ResolvedRoute, RetryBackoff, RouteRequest, RouteTarget,
};
use sk_sessions::stitch::stitch_for_send;

use crate::runtime::compact::{
    compact, extractive_summary, prepare_compaction, should_compact, CompactReason,
    SummarizeMode, SummarizeRequest,
};
use crate::runtime::run_state::QueueBehavior;
use crate::runtime::steps::{execute_step, StepRequest};
use crate::runtime::{capability_for_tool, truncate_str};
use crate::state::AppState;

/// Hard ceiling on iterations per loop, against runaway tool cycles.
const MAX_LOOP_ITERATIONS: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Start / stop entry points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    pub prompt: String,
    #[serde(rename = "autoRun", default = "default_true")]
    pub auto_run: bool,
    #[serde(rename = "streamingBehavior", default)]
    pub streaming_behavior: Option<QueueBehavior>,
    #[serde(rename = "sessionOptions", default)]
    pub session_options: Option<SessionOptions>,
}

fn default_true() -> bool {
    true
}

/// Handle `brain.run.start`. Returns the acknowledgement immediately;
/// the loop (including its pre-send compaction check) runs detached.
pub fn start_run(state: &AppState, request: StartRequest) -> Result<Value> {
    let session_id = match &request.session_id {
        Some(id) if state.sessions.exists(id) => id.clone(),
        Some(id) => state.sessions.create(Some(id.clone()))?.id,
        None => state.sessions.create(None)?.id,
    };

    if let Some(options) = &request.session_options {
        state
            .runs
            .set_route_options(&session_id, options.role.clone(), options.profile.clone());
    }

    let run_state = state.runs.snapshot(&session_id);

    // Stopping loop still holds the session: acknowledge, never enqueue
    // into a queue that stop already drained, never spawn a second loop.
    if run_state.running && run_state.stopped {
        return Ok(serde_json::json!({
            "sessionId": session_id,
            "running": true,
            "stopped": true,
        }));
    }

    if run_state.running {
        let Some(behavior) = request.streaming_behavior else {
            return Err(Error::Args(
                "session is running; pass streamingBehavior (steer | follow_up)".into(),
            ));
        };
        let prompt = state.runs.enqueue(&session_id, behavior, &request.prompt);
        return Ok(serde_json::json!({
            "sessionId": session_id,
            "running": true,
            "stopped": false,
            "queued": true,
            "queuedPromptId": prompt.id,
        }));
    }

    if !request.auto_run {
        // The prompt is recorded but no loop starts; a stopped session
        // stays stopped (only autoRun=true clears the latch).
        state
            .sessions
            .append_message(&session_id, Role::User, &request.prompt, None, None)?;
        return Ok(serde_json::json!({
            "sessionId": session_id,
            "running": false,
            "stopped": run_state.stopped,
        }));
    }

    if run_state.stopped {
        state.runs.clear_stopped(&session_id);
    }

    state
        .sessions
        .append_message(&session_id, Role::User, &request.prompt, None, None)?;

    if !state.runs.try_begin_loop(&session_id) {
        // Lost the race against another start; queue semantics apply.
        return Err(Error::Busy(format!(
            "session `{session_id}` loop already starting"
        )));
    }

    let task_state = state.clone();
    let task_session = session_id.clone();
    tokio::spawn(async move {
        run_loop(task_state, task_session).await;
    });

    Ok(serde_json::json!({
        "sessionId": session_id,
        "running": true,
        "stopped": false,
    }))
}

/// Handle `brain.run.stop`: latch stopped, drain the queue, abort the
/// session's outstanding bridge invokes. The loop observes the latch
/// at its next boundary.
pub fn stop_run(state: &AppState, session_id: &str) -> Result<Value> {
    if !state.sessions.exists(session_id) {
        return Err(Error::SessionNotFound(session_id.to_owned()));
    }
    let run_state = state.runs.stop(session_id);
    let aborted = state.bridge.abort_invokes_by_session(session_id);
    Ok(serde_json::json!({
        "sessionId": session_id,
        "running": run_state.running,
        "stopped": true,
        "abortedInvokes": aborted,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the loop to completion and release the running flag. Returns
/// the terminal status string.
pub async fn run_loop(state: AppState, session_id: String) -> String {
    let status = run_loop_inner(&state, &session_id).await;
    state.events.emit(TraceEvent::LoopDone {
        session_id: session_id.clone(),
        status: status.clone(),
    });
    let _ = run_chain(
        &state.hooks,
        HookName::LoopDone,
        serde_json::json!({ "sessionId": session_id, "status": status }),
    )
    .await;
    // The loop owns this transition; `stop` never forces it.
    state.runs.finish_loop(&session_id);
    status
}

async fn run_loop_inner(state: &AppState, session_id: &str) -> String {
    state.events.emit(TraceEvent::LoopStart {
        session_id: session_id.to_owned(),
    });

    let mut attempt: u32 = 0;

    for _iteration in 0..MAX_LOOP_ITERATIONS {
        // Stop is observed at the iteration boundary.
        if state.runs.is_stopped(session_id) {
            return "stopped".into();
        }

        let outcome = run_chain(
            &state.hooks,
            HookName::LoopBeforeIteration,
            serde_json::json!({ "sessionId": session_id }),
        )
        .await;
        if let Some(reason) = outcome.blocked {
            state.runs.record_error(session_id, &reason);
            return "failed".into();
        }

        // 1. Pre-send compaction check (threshold; hook may veto).
        if let Err(e) = maybe_compact(state, session_id, false).await {
            tracing::warn!(session_id, error = %e, "pre-send compaction failed; continuing");
        }

        // 2. Resolve the LLM route.
        let config = state.config.read().clone();
        let route = {
            let run_state = state.runs.snapshot(session_id);
            let request = RouteRequest {
                profile: run_state.profile.clone(),
                role: run_state.role.clone(),
                chain_position: run_state.chain_position,
            };
            match resolve_route(&config.llm, &state.llm, &request) {
                Ok(route) => route,
                Err(e) => {
                    state.events.emit(TraceEvent::LlmRouteBlocked {
                        session_id: session_id.to_owned(),
                        reason: e.reason().to_owned(),
                    });
                    state.runs.record_error(session_id, &e.to_string());
                    return "failed".into();
                }
            }
        };
        state.events.emit(TraceEvent::LlmRouteSelected {
            session_id: session_id.to_owned(),
            profile: route.profile.id.clone(),
            provider: route.provider.clone(),
            model: route.model.clone(),
            source: route.source.as_str().to_owned(),
            role: route.role.clone(),
            ordered_profiles: route.ordered_profiles.clone(),
        });

        // 3. Build and send the chat request.
        let response = match send_chat(state, session_id, &route).await {
            Ok(Some(response)) => response,
            Ok(None) => return "failed".into(), // blocked by hook
            Err(chat_err) => {
                let decision =
                    handle_agent_end(state, session_id, &chat_err, attempt, &route, &config).await;
                match decision {
                    LoopDecision::Retry { delay_ms, reason } => {
                        state.events.emit(TraceEvent::AutoRetryStart {
                            session_id: session_id.to_owned(),
                            attempt: attempt + 1,
                            delay_ms,
                            reason,
                        });
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        continue;
                    }
                    LoopDecision::Continue => {
                        if let Err(e) = maybe_compact(state, session_id, true).await {
                            tracing::warn!(session_id, error = %e, "overflow compaction failed");
                            state.runs.record_error(session_id, &e.to_string());
                            return "failed".into();
                        }
                        attempt = 0;
                        continue;
                    }
                    LoopDecision::Escalate { to, reason } => {
                        state.events.emit(TraceEvent::LlmRouteEscalated {
                            session_id: session_id.to_owned(),
                            from_profile: route.profile.id.clone(),
                            to_profile: to,
                            reason,
                        });
                        let position = state.runs.chain_position(session_id);
                        state.runs.set_chain_position(session_id, position + 1);
                        attempt = 0;
                        continue;
                    }
                    LoopDecision::Done => return "done".into(),
                    LoopDecision::FailedExecute { reason } => {
                        state.runs.record_error(session_id, &reason);
                        return "failed".into();
                    }
                }
            }
        };
        attempt = 0;

        // 4. Act on the response.
        if response.tool_calls.is_empty() {
            if let Err(e) = state.sessions.append_message(
                session_id,
                Role::Assistant,
                &response.content,
                None,
                None,
            ) {
                state.runs.record_error(session_id, &e.to_string());
                return "failed".into();
            }

            // A queued prompt keeps the loop going; steer landed at the
            // head, followUps run in arrival order.
            if let Some(prompt) = state.runs.pop_next(session_id) {
                if let Err(e) = state.sessions.append_message(
                    session_id,
                    Role::User,
                    &prompt.text,
                    None,
                    None,
                ) {
                    state.runs.record_error(session_id, &e.to_string());
                    return "failed".into();
                }
                continue;
            }
            return "done".into();
        }

        // Tool calls: log the pending calls, then execute each.
        if let Err(e) = state.sessions.append_message(
            session_id,
            Role::Assistant,
            &response.content,
            None,
            None,
        ) {
            state.runs.record_error(session_id, &e.to_string());
            return "failed".into();
        }
        for call in &response.tool_calls {
            let _ = state.sessions.append_tool_call(
                session_id,
                &call.call_id,
                &call.tool_name,
                call.arguments.clone(),
            );
        }

        for call in &response.tool_calls {
            // Stop is observed between steps (after each await point).
            if state.runs.is_stopped(session_id) {
                return "stopped".into();
            }
            let content = execute_tool_call(state, session_id, call).await;
            if let Err(e) = state.sessions.append_message(
                session_id,
                Role::Tool,
                &content,
                Some(call.call_id.clone()),
                Some(call.tool_name.clone()),
            ) {
                state.runs.record_error(session_id, &e.to_string());
                return "failed".into();
            }
        }
    }

    state
        .runs
        .record_error(session_id, "loop iteration limit reached");
    "failed".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM call with hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LoopResponse {
    content: String,
    tool_calls: Vec<ToolCall>,
}

/// Fire `llm.before_request`, send, fire `llm.after_response`.
/// `Ok(None)` means a hook blocked the request.
async fn send_chat(
    state: &AppState,
    session_id: &str,
    route: &ResolvedRoute,
) -> std::result::Result<Option<LoopResponse>, ChatError> {
    let view = match state.sessions.conversation_view(session_id) {
        Ok(view) => view,
        Err(e) => {
            return Err(ChatError {
                provider: route.provider.clone(),
                kind: sk_providers::ChatErrorKind::Api,
                message: format!("building conversation view: {e}"),
                status: None,
            });
        }
    };
    let mut messages = stitch_for_send(&view);
    let mut model = route.model.clone();
    let mut temperature: f32 = 0.2;

    let envelope = serde_json::json!({
        "sessionId": session_id,
        "model": model,
        "temperature": temperature,
        "messages": messages,
    });
    let outcome = run_chain(&state.hooks, HookName::LlmBeforeRequest, envelope).await;
    if let Some(reason) = outcome.blocked {
        state.runs.record_error(session_id, &format!("llm request blocked: {reason}"));
        return Ok(None);
    }
    if let Some(patched) = outcome.envelope.get("model").and_then(|m| m.as_str()) {
        model = patched.to_owned();
    }
    if let Some(patched) = outcome.envelope.get("temperature").and_then(Value::as_f64) {
        temperature = patched as f32;
    }
    if let Some(patched) = outcome.envelope.get("messages") {
        if let Ok(parsed) = serde_json::from_value::<Vec<Message>>(patched.clone()) {
            messages = parsed;
        }
    }

    // Trace carries counts and a trimmed snippet, never the payload.
    let char_count: usize = messages.iter().map(|m| m.content.len()).sum();
    let last_user_snippet = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| truncate_str(&m.content, 120))
        .unwrap_or_default();
    state.events.emit(TraceEvent::LlmRequest {
        session_id: session_id.to_owned(),
        profile: route.profile.id.clone(),
        model: model.clone(),
        message_count: messages.len(),
        char_count,
        last_user_snippet,
    });

    let provider = state.llm.get(&route.provider).ok_or_else(|| ChatError {
        provider: route.provider.clone(),
        kind: sk_providers::ChatErrorKind::Api,
        message: "provider vanished after route resolution".into(),
        status: None,
    })?;

    let request = ChatRequest {
        messages,
        tools: state.contracts.definitions(),
        temperature: Some(temperature),
        max_tokens: None,
        model: Some(model),
        target: Some(target_for(&route.profile)),
    };
    let response = provider.chat(&request).await?;

    // llm.after_response: patches may rewrite content / tool calls.
    let envelope = serde_json::json!({
        "sessionId": session_id,
        "content": response.content,
        "toolCalls": response.tool_calls,
    });
    let outcome = run_chain(&state.hooks, HookName::LlmAfterResponse, envelope).await;
    if let Some(reason) = outcome.blocked {
        state.runs.record_error(session_id, &format!("llm response blocked: {reason}"));
        return Ok(None);
    }
    let content = outcome
        .envelope
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or(&response.content)
        .to_owned();
    let tool_calls = outcome
        .envelope
        .get("toolCalls")
        .and_then(|t| serde_json::from_value::<Vec<ToolCall>>(t.clone()).ok())
        .unwrap_or(response.tool_calls);

    Ok(Some(LoopResponse {
        content,
        tool_calls,
    }))
}

fn target_for(profile: &LlmProfile) -> RouteTarget {
    RouteTarget {
        api_base: profile.llm_api_base.clone(),
        api_key: profile.llm_api_key.clone(),
        model: profile.llm_model.clone(),
        request_timeout_ms: profile.request_timeout_ms,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execute one model-initiated tool call and render the tool message
/// content the model will read back.
async fn execute_tool_call(state: &AppState, session_id: &str, call: &ToolCall) -> String {
    // Contract gate: unknown names and missing required args fail
    // before anything executes.
    let Some(contract) = state.contracts.resolve(&call.tool_name) else {
        return error_content("E_ARGS", &format!("unknown tool `{}`", call.tool_name));
    };
    if let Err(e) = contract.check_required(&call.arguments) {
        return error_content("E_ARGS", &e.to_string());
    }

    let (capability, action) = capability_for_tool(&contract.canonical_name);
    let result = execute_step(
        state,
        StepRequest {
            session_id: session_id.to_owned(),
            mode: None,
            capability: Some(capability),
            action,
            args: call.arguments.clone(),
            verify_policy: None,
            invoke_id: Some(call.call_id.clone()),
        },
    )
    .await;

    if result.ok {
        result
            .data
            .map(|d| {
                if let Some(text) = d.as_str() {
                    text.to_owned()
                } else {
                    d.to_string()
                }
            })
            .unwrap_or_default()
    } else {
        error_content(
            result.error_code.as_deref().unwrap_or("E_INTERNAL"),
            result.error.as_deref().unwrap_or("tool execution failed"),
        )
    }
}

fn error_content(code: &str, message: &str) -> String {
    serde_json::json!({ "error": message, "errorCode": code }).to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry / compact / escalate decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
enum LoopDecision {
    Retry { delay_ms: u64, reason: String },
    Continue,
    Escalate { to: String, reason: String },
    Done,
    FailedExecute { reason: String },
}

impl LoopDecision {
    fn action_str(&self) -> &'static str {
        match self {
            LoopDecision::Retry { .. } => "retry",
            LoopDecision::Continue => "continue",
            LoopDecision::Escalate { .. } => "escalate",
            LoopDecision::Done => "done",
            LoopDecision::FailedExecute { .. } => "failed_execute",
        }
    }
}

/// Classify a chat failure into the loop's next move, then let the
/// `agent_end.after` hook patch the decision.
async fn handle_agent_end(
    state: &AppState,
    session_id: &str,
    error: &ChatError,
    attempt: u32,
    route: &ResolvedRoute,
    config: &Config,
) -> LoopDecision {
    let decision = classify_agent_end(
        error,
        attempt,
        &route.profile,
        &route.ordered_profiles,
        config.llm.escalation_policy,
    );

    let envelope = serde_json::json!({
        "sessionId": session_id,
        "action": decision.action_str(),
        "reason": error.message,
        "overflow": error.is_overflow(),
    });
    let outcome = run_chain(&state.hooks, HookName::AgentEndAfter, envelope).await;
    if outcome.is_blocked() {
        return LoopDecision::FailedExecute {
            reason: "agent_end blocked".into(),
        };
    }

    let patched_action = outcome
        .envelope
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or(decision.action_str())
        .to_owned();
    if patched_action == decision.action_str() {
        return decision;
    }

    // A patch changed the action; rebuild the decision around it.
    match patched_action.as_str() {
        "retry" => LoopDecision::Retry {
            delay_ms: 500,
            reason: "patched".into(),
        },
        "continue" => LoopDecision::Continue,
        "escalate" => {
            match decide_profile_escalation(
                &route.ordered_profiles,
                &route.profile.id,
                true,
                config.llm.escalation_policy,
            ) {
                EscalationDecision::Escalate { to, reason } => {
                    LoopDecision::Escalate { to, reason }
                }
                EscalationDecision::Blocked { reason } | EscalationDecision::NoChange { reason } => {
                    LoopDecision::FailedExecute { reason }
                }
            }
        }
        "done" => LoopDecision::Done,
        _ => LoopDecision::FailedExecute {
            reason: error.message.clone(),
        },
    }
}

fn classify_agent_end(
    error: &ChatError,
    attempt: u32,
    profile: &LlmProfile,
    ordered_profiles: &[String],
    policy: EscalationPolicy,
) -> LoopDecision {
    // Overflow never retries; it always answers with compaction.
    if error.is_overflow() {
        return LoopDecision::Continue;
    }

    if error.retryable() {
        let backoff = RetryBackoff::from_profile(profile.retry_max_attempts, profile.retry_cap_delay_ms);
        if !backoff.exhausted(attempt) {
            return LoopDecision::Retry {
                delay_ms: backoff.delay_for_attempt(attempt).as_millis() as u64,
                reason: error.message.clone(),
            };
        }
        // Retries on this profile are spent: repeated failure.
        return match decide_profile_escalation(ordered_profiles, &profile.id, true, policy) {
            EscalationDecision::Escalate { to, reason } => LoopDecision::Escalate { to, reason },
            EscalationDecision::Blocked { reason } | EscalationDecision::NoChange { reason } => {
                LoopDecision::FailedExecute {
                    reason: format!("retries exhausted; escalation {reason}"),
                }
            }
        };
    }

    LoopDecision::FailedExecute {
        reason: error.message.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Check-and-run compaction. `overflow=true` (model-reported) is
/// authoritative; the threshold path may be vetoed by the
/// `compaction.check.before` hook.
pub async fn maybe_compact(state: &AppState, session_id: &str, overflow: bool) -> Result<bool> {
    let entries = state.sessions.entries(session_id)?;
    let config = state.config.read().compaction.clone();

    let decision = should_compact(&entries, config.threshold_tokens, overflow);
    if !decision.should_compact {
        return Ok(false);
    }
    let reason = decision.reason.unwrap_or(CompactReason::Manual);

    let outcome = run_chain(
        &state.hooks,
        HookName::CompactionCheckBefore,
        serde_json::json!({ "sessionId": session_id, "reason": reason.as_str() }),
    )
    .await;
    if outcome.is_blocked() {
        tracing::debug!(session_id, "compaction vetoed by hook");
        return Ok(false);
    }

    state.events.emit(TraceEvent::AutoCompactionStart {
        session_id: session_id.to_owned(),
        reason: reason.as_str().to_owned(),
    });

    let preparation = prepare_compaction(&entries, None, config.keep_tail, config.split_turn);
    let compaction = compact(&preparation, |req| summarize(state, session_id, req)).await?;

    // compaction.summary: plugins may rewrite the final summary.
    let outcome = run_chain(
        &state.hooks,
        HookName::CompactionSummary,
        serde_json::json!({ "sessionId": session_id, "summary": compaction.summary }),
    )
    .await;
    let summary = outcome
        .envelope
        .get("summary")
        .and_then(|s| s.as_str())
        .unwrap_or(&compaction.summary)
        .to_owned();

    state.sessions.append_compaction(
        session_id,
        &summary,
        compaction.first_kept_entry_id.clone(),
        compaction.tokens_before,
        compaction.tokens_after,
        reason.as_str(),
    )?;

    state.events.emit(TraceEvent::SessionCompact {
        session_id: session_id.to_owned(),
        first_kept_entry_id: compaction.first_kept_entry_id.unwrap_or_default(),
    });
    state.events.emit(TraceEvent::AutoCompactionEnd {
        session_id: session_id.to_owned(),
        tokens_before: compaction.tokens_before,
        tokens_after: compaction.tokens_after,
    });

    Ok(true)
}

/// Summarize dropped entries with the session's LLM route; fall back
/// to the deterministic extractive summary when no route is usable.
async fn summarize(state: &AppState, session_id: &str, req: SummarizeRequest) -> Result<String> {
    let fallback = extractive_summary(&req.entries, req.previous_summary.as_deref());
    if req.entries.is_empty() {
        return Ok(fallback);
    }

    let config = state.config.read().clone();
    let run_state = state.runs.snapshot(session_id);
    let route = match resolve_route(
        &config.llm,
        &state.llm,
        &RouteRequest {
            profile: run_state.profile,
            role: run_state.role,
            chain_position: run_state.chain_position,
        },
    ) {
        Ok(route) => route,
        Err(_) => return Ok(fallback),
    };
    let Some(provider) = state.llm.get(&route.provider) else {
        return Ok(fallback);
    };

    let mut transcript = String::new();
    for entry in &req.entries {
        if let sk_sessions::entry::EntryKind::Message { role, text, .. } = &entry.kind {
            let label = match role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            transcript.push_str(label);
            transcript.push_str(": ");
            transcript.push_str(&truncate_str(text, 2000));
            transcript.push('\n');
        }
    }

    let instruction = match req.mode {
        SummarizeMode::History => {
            "Summarize the following conversation history into a concise summary that \
             preserves the current goal, key decisions, open threads, and tool state. \
             Be concise but keep all actionable context."
        }
        SummarizeMode::TurnPrefix => {
            "Summarize the beginning of this in-progress exchange so its conclusion \
             still makes sense when read after the summary."
        }
    };
    let mut prompt = String::new();
    if let Some(previous) = &req.previous_summary {
        prompt.push_str("Earlier summary:\n");
        prompt.push_str(previous);
        prompt.push_str("\n\n");
    }
    prompt.push_str(instruction);
    prompt.push_str("\n\nCONVERSATION:\n");
    prompt.push_str(&transcript);

    let request = ChatRequest {
        messages: vec![Message::user(prompt)],
        tools: Vec::new(),
        temperature: Some(0.1),
        max_tokens: Some(2000),
        model: None,
        target: Some(target_for(&route.profile)),
    };
    match provider.chat(&request).await {
        Ok(response) if !response.content.is_empty() => Ok(response.content),
        Ok(_) => Ok(fallback),
        Err(e) => {
            tracing::warn!(session_id, error = %e, "summarizer unavailable; using extractive summary");
            Ok(fallback)
        }
    }
}
