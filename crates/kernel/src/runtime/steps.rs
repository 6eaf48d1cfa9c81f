//! Step execution: resolve a capability or mode provider, run the
//! hooks around the call, and verify when policy asks for it.

use serde::{Deserialize, Serialize};

use sk_capability::{CapabilityInput, Mode, VerifyPolicy};
use sk_domain::error::ErrorCode;
use sk_domain::trace::TraceEvent;
use sk_hooks::{run_chain, HookName};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct StepRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    pub action: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(rename = "verifyPolicy", default)]
    pub verify_policy: Option<VerifyPolicy>,
    /// Stable dedup id for bridge-backed capabilities. Set by the run
    /// loop (the tool call id); not part of the wire API.
    #[serde(skip)]
    pub invoke_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(rename = "modeUsed", skip_serializing_if = "Option::is_none")]
    pub mode_used: Option<String>,
    #[serde(rename = "capabilityUsed", skip_serializing_if = "Option::is_none")]
    pub capability_used: Option<String>,
    #[serde(rename = "fallbackFrom", skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<String>,
    pub verified: bool,
    #[serde(rename = "verifyReason")]
    pub verify_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl StepResult {
    fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            mode_used: None,
            capability_used: None,
            fallback_from: None,
            verified: false,
            verify_reason: "verify_policy_off".into(),
            error: Some(message.into()),
            error_code: Some(code.as_str().to_owned()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn execute_step(state: &AppState, request: StepRequest) -> StepResult {
    state.events.emit(TraceEvent::StepExecute {
        session_id: request.session_id.clone(),
        action: request.action.clone(),
        capability: request.capability.clone(),
        mode: request.mode.clone(),
    });

    let result = execute_step_inner(state, &request).await;

    state.events.emit(TraceEvent::StepExecuteResult {
        session_id: request.session_id.clone(),
        action: request.action.clone(),
        ok: result.ok,
        mode_used: result.mode_used.clone(),
        fallback_from: result.fallback_from.clone(),
        error_code: result.error_code.clone(),
    });

    result
}

async fn execute_step_inner(state: &AppState, request: &StepRequest) -> StepResult {
    let mode = match request.mode.as_deref().map(Mode::parse) {
        Some(None) => {
            return StepResult::failure(
                ErrorCode::Args,
                format!("unknown mode `{}`", request.mode.as_deref().unwrap_or("")),
            );
        }
        Some(Some(mode)) => Some(mode),
        None => None,
    };

    // tool.before_call: handlers may patch args or block the call.
    let envelope = serde_json::json!({
        "sessionId": request.session_id,
        "action": request.action,
        "capability": request.capability,
        "mode": request.mode,
        "args": request.args,
    });
    let outcome = run_chain(&state.hooks, HookName::ToolBeforeCall, envelope).await;
    if let Some(reason) = outcome.blocked {
        return StepResult::failure(ErrorCode::Internal, format!("tool call blocked: {reason}"));
    }
    let args = outcome
        .envelope
        .get("args")
        .cloned()
        .unwrap_or_else(|| request.args.clone());

    let input = CapabilityInput {
        session_id: request.session_id.clone(),
        action: request.action.clone(),
        args,
        invoke_id: request.invoke_id.clone(),
    };

    let mut result = if let Some(capability) = &request.capability {
        execute_capability(state, request, capability, mode, input).await
    } else if let Some(mode) = mode {
        execute_mode_lane(state, mode, input).await
    } else {
        StepResult::failure(ErrorCode::Args, "step needs a capability or a mode")
    };

    // tool.after_result: patches may rewrite the data payload.
    let after = serde_json::json!({
        "sessionId": request.session_id,
        "action": request.action,
        "ok": result.ok,
        "data": result.data,
    });
    let outcome = run_chain(&state.hooks, HookName::ToolAfterResult, after).await;
    if !outcome.is_blocked() {
        if let Some(data) = outcome.envelope.get("data") {
            if result.ok && !data.is_null() {
                result.data = Some(data.clone());
            }
        }
    }

    result
}

async fn execute_capability(
    state: &AppState,
    request: &StepRequest,
    capability: &str,
    mode: Option<Mode>,
    input: CapabilityInput,
) -> StepResult {
    let policy = state.policies.effective(capability);
    let input_for_verify = input.clone();

    match state
        .capabilities
        .invoke_capability(capability, mode, input)
        .await
    {
        Ok((data, mode_used)) => {
            let verify_policy = request.verify_policy.unwrap_or(policy.default_verify_policy);
            let (verified, verify_reason, verify_failed) =
                run_verification(state, capability, verify_policy, &input_for_verify).await;

            if verify_failed {
                return StepResult {
                    ok: false,
                    data: Some(data),
                    mode_used: Some(mode_used.as_str().to_owned()),
                    capability_used: Some(capability.to_owned()),
                    fallback_from: None,
                    verified: false,
                    verify_reason,
                    error: Some("post-step verification failed".into()),
                    error_code: Some(ErrorCode::VerifyFailed.as_str().to_owned()),
                };
            }

            StepResult {
                ok: true,
                data: Some(data),
                mode_used: Some(mode_used.as_str().to_owned()),
                capability_used: Some(capability.to_owned()),
                fallback_from: None,
                verified,
                verify_reason,
                error: None,
                error_code: None,
            }
        }
        Err(error) => StepResult {
            ok: false,
            data: None,
            mode_used: error.mode_used.map(|m| m.as_str().to_owned()),
            capability_used: error.capability_used.clone(),
            fallback_from: None,
            verified: false,
            verify_reason: "verify_policy_off".into(),
            error: Some(error.to_string()),
            error_code: Some(error.code().as_str().to_owned()),
        },
    }
}

async fn execute_mode_lane(state: &AppState, mode: Mode, input: CapabilityInput) -> StepResult {
    // The mode lane is the browser legacy path; its fallback gate is
    // the authoritative policy for `browser.action`.
    let allow_fallback = state.policies.effective("browser.action").allow_script_fallback;

    match state.capabilities.invoke_mode(mode, input, allow_fallback).await {
        Ok(outcome) => StepResult {
            ok: true,
            data: Some(outcome.data),
            mode_used: Some(outcome.mode_used.as_str().to_owned()),
            capability_used: None,
            fallback_from: outcome.fallback_from.map(|m| m.as_str().to_owned()),
            verified: false,
            verify_reason: "verify_policy_off".into(),
            error: None,
            error_code: None,
        },
        Err(error) => StepResult {
            ok: false,
            data: None,
            mode_used: error.mode_used.map(|m| m.as_str().to_owned()),
            capability_used: None,
            fallback_from: None,
            verified: false,
            verify_reason: "verify_policy_off".into(),
            error: Some(error.to_string()),
            error_code: Some(error.code().as_str().to_owned()),
        },
    }
}

/// Run post-step verification per policy. Returns
/// `(verified, verify_reason, hard_failure)`.
async fn run_verification(
    state: &AppState,
    capability: &str,
    policy: VerifyPolicy,
    input: &CapabilityInput,
) -> (bool, String, bool) {
    let critical = input
        .args
        .get("critical")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let should_verify = match policy {
        VerifyPolicy::Off => false,
        VerifyPolicy::OnCritical => critical,
        VerifyPolicy::Always => true,
    };
    if !should_verify {
        return (false, "verify_policy_off".into(), false);
    }
    // Verifying the verifier would recurse.
    if capability == "browser.verify" {
        return (false, "verify_policy_off".into(), false);
    }

    let verify_input = CapabilityInput {
        session_id: input.session_id.clone(),
        action: "verify".into(),
        args: serde_json::json!({
            "capability": capability,
            "action": input.action,
            "args": input.args,
        }),
        invoke_id: None,
    };
    match state
        .capabilities
        .invoke_capability("browser.verify", None, verify_input)
        .await
    {
        Ok((data, _)) => {
            let passed = data
                .get("verified")
                .and_then(|v| v.as_bool())
                .unwrap_or_else(|| !data.is_null());
            if passed {
                (true, "verified".into(), false)
            } else {
                (false, "verify_failed".into(), true)
            }
        }
        Err(error) => {
            if error.code() == ErrorCode::RuntimeNotReady {
                (false, "verify_adapter_missing".into(), false)
            } else {
                (false, "verify_failed".into(), true)
            }
        }
    }
}
