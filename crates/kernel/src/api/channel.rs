//! The message channel: every request is `{type, id?, ...}`, every
//! response `{ok, data?, error?, errorCode?}` correlated by `id`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use sk_capability::{CapabilityPolicy, Plugin, PluginContext, PluginManifest};
use sk_domain::error::{Error, Result};

use crate::api::token_eq;
use crate::config_io;
use crate::runtime::agents::{agent_run, AgentRunRequest};
use crate::runtime::regenerate::{edit_rerun, regenerate, EditRerunRequest, RegenerateRequest};
use crate::runtime::run_loop::{start_run, stop_run, StartRequest};
use crate::runtime::run_state::QueueBehavior;
use crate::runtime::steps::{execute_step, StepRequest};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub token: Option<String>,
}

/// GET /v1/channel — upgrade to the message channel.
///
/// Auth: the env var named by `server.token_env` holds the expected
/// bearer token; unset means open access (dev mode).
pub async fn channel_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> impl IntoResponse {
    let token_env = state.config.read().server.token_env.clone();
    if let Ok(expected) = std::env::var(&token_env) {
        let provided = query.token.as_deref().unwrap_or("");
        if !token_eq(provided, &expected) {
            return (
                axum::http::StatusCode::UNAUTHORIZED,
                "invalid or missing api token",
            )
                .into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let response = match serde_json::from_str::<Value>(&text) {
                    Ok(request) => handle_request(&state, request).await,
                    Err(e) => failure(None, &Error::Args(format!("invalid JSON: {e}"))),
                };
                let Ok(serialized) = serde_json::to_string(&response) else {
                    continue;
                };
                if sink.send(Message::Text(serialized)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

fn success(id: Option<Value>, data: Value) -> Value {
    let mut response = serde_json::json!({ "ok": true, "data": data });
    if let Some(id) = id {
        response["id"] = id;
    }
    response
}

fn failure(id: Option<Value>, error: &Error) -> Value {
    let mut response = serde_json::json!({
        "ok": false,
        "error": error.to_string(),
        "errorCode": error.code().as_str(),
    });
    if let Some(id) = id {
        response["id"] = id;
    }
    response
}

/// Dispatch one request by its `type`.
pub async fn handle_request(state: &AppState, request: Value) -> Value {
    let id = request.get("id").cloned();
    let Some(request_type) = request.get("type").and_then(|t| t.as_str()) else {
        return failure(id, &Error::Args("request needs a `type`".into()));
    };
    match dispatch(state, request_type, &request).await {
        Ok(data) => success(id, data),
        Err(error) => failure(id, &error),
    }
}

fn parse<T: serde::de::DeserializeOwned>(request: &Value) -> Result<T> {
    serde_json::from_value(request.clone()).map_err(|e| Error::Args(format!("bad request: {e}")))
}

fn session_id_of(request: &Value) -> Result<String> {
    request
        .get("sessionId")
        .and_then(|s| s.as_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::Args("request needs `sessionId`".into()))
}

async fn dispatch(state: &AppState, request_type: &str, request: &Value) -> Result<Value> {
    match request_type {
        // ── Config ────────────────────────────────────────────────
        "config.get" => Ok(config_io::redacted(&state.config.read())),
        "config.save" => {
            let payload = request
                .get("config")
                .cloned()
                .ok_or_else(|| Error::Args("config.save needs `config`".into()))?;
            config_io::save_config(state, payload)
        }

        // ── Run control ───────────────────────────────────────────
        "brain.run.start" => start_run(state, parse::<StartRequest>(request)?),
        "brain.run.stop" => stop_run(state, &session_id_of(request)?),
        "brain.run.steer" | "brain.run.follow_up" => {
            let mut start: StartRequest = parse(request)?;
            start.streaming_behavior = Some(if request_type == "brain.run.steer" {
                QueueBehavior::Steer
            } else {
                QueueBehavior::FollowUp
            });
            start_run(state, start)
        }
        "brain.run.queue.promote" => {
            let session_id = session_id_of(request)?;
            let prompt_id = request
                .get("queuedPromptId")
                .and_then(|p| p.as_str())
                .ok_or_else(|| Error::Args("promote needs `queuedPromptId`".into()))?;
            let run_state = state.runs.promote(&session_id, prompt_id);
            Ok(serde_json::to_value(run_state)?)
        }
        "brain.run.regenerate" => regenerate(state, parse::<RegenerateRequest>(request)?),
        "brain.run.edit_rerun" => edit_rerun(state, parse::<EditRerunRequest>(request)?),

        // ── Agents ────────────────────────────────────────────────
        "brain.agent.run" => agent_run(state, parse::<AgentRunRequest>(request)?).await,

        // ── Sessions ──────────────────────────────────────────────
        "brain.session.list" => {
            let headers = state.sessions.list();
            Ok(serde_json::json!({ "sessions": headers }))
        }
        "brain.session.view" => {
            let session_id = session_id_of(request)?;
            let header = state.sessions.header(&session_id)?;
            let entries = state.sessions.entries(&session_id)?;
            Ok(serde_json::json!({ "header": header, "entries": entries }))
        }
        "brain.session.fork" => {
            let session_id = session_id_of(request)?;
            let leaf_id = request
                .get("leafId")
                .and_then(|l| l.as_str())
                .ok_or_else(|| Error::Args("fork needs `leafId`".into()))?;
            let source_entry_id = request
                .get("sourceEntryId")
                .and_then(|s| s.as_str())
                .unwrap_or(leaf_id);
            let reason = request
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("manual");
            let header = state
                .sessions
                .fork(&session_id, source_entry_id, leaf_id, reason)?;
            Ok(serde_json::json!({ "session": header }))
        }
        "brain.session.delete" => {
            let session_id = session_id_of(request)?;
            state.sessions.delete(&session_id)?;
            Ok(serde_json::json!({ "deleted": session_id }))
        }
        "brain.session.title.refresh" => {
            let session_id = session_id_of(request)?;
            let header = state.sessions.refresh_title(&session_id)?;
            Ok(serde_json::json!({ "session": header }))
        }

        // ── Steps ─────────────────────────────────────────────────
        "brain.step.execute" => {
            let step: StepRequest = parse(request)?;
            let result = execute_step(state, step).await;
            Ok(serde_json::to_value(result)?)
        }
        "brain.step.stream" => {
            let session_id = session_id_of(request)?;
            let max_events = request
                .get("maxEvents")
                .and_then(Value::as_u64)
                .map(|n| n as usize);
            let max_bytes = request
                .get("maxBytes")
                .and_then(Value::as_u64)
                .map(|n| n as usize);

            // Empty ring after a restart: rebuild it from the log.
            let (_, probe) = state.events.stream(&session_id, Some(0), None);
            if probe.total_events == 0 && state.sessions.exists(&session_id) {
                let entries = state.sessions.entries(&session_id)?;
                state.events.rehydrate_from_entries(&session_id, &entries);
            }

            let (stream, meta) = state.events.stream(&session_id, max_events, max_bytes);
            Ok(serde_json::json!({ "stream": stream, "streamMeta": meta }))
        }

        // ── Debug ─────────────────────────────────────────────────
        "brain.debug.config" => {
            let config = state.config.read();
            let issues: Vec<String> = config.validate().iter().map(ToString::to_string).collect();
            Ok(serde_json::json!({
                "config": config_io::redacted(&config),
                "issues": issues,
            }))
        }
        "brain.debug.dump" => {
            let mut sessions = serde_json::Map::new();
            for session_id in state.runs.session_ids() {
                let run_state = state.runs.snapshot(&session_id);
                let (_, meta) = state.events.stream(&session_id, Some(0), None);
                sessions.insert(
                    session_id,
                    serde_json::json!({
                        "runState": run_state,
                        "totalEvents": meta.total_events,
                    }),
                );
            }
            Ok(serde_json::json!({
                "sessions": sessions,
                "bridge": format!("{:?}", state.bridge.state()),
                "capabilities": state.capabilities.capabilities(),
            }))
        }
        "brain.debug.plugins" => Ok(serde_json::json!({ "plugins": state.plugins.records() })),

        // ── Plugins ───────────────────────────────────────────────
        "brain.plugin.register" => {
            let manifest: PluginManifest = serde_json::from_value(
                request
                    .get("manifest")
                    .cloned()
                    .ok_or_else(|| Error::Args("plugin.register needs `manifest`".into()))?,
            )
            .map_err(|e| Error::Args(format!("bad manifest: {e}")))?;
            let policies = request
                .get("policies")
                .and_then(|p| {
                    serde_json::from_value::<std::collections::HashMap<String, CapabilityPolicy>>(
                        p.clone(),
                    )
                    .ok()
                })
                .unwrap_or_default();
            let record = state
                .plugins
                .register(Arc::new(DeclarativePlugin { manifest, policies }))?;
            Ok(serde_json::to_value(record)?)
        }
        "brain.plugin.enable" => {
            let plugin_id = plugin_id_of(request)?;
            Ok(serde_json::to_value(state.plugins.enable(&plugin_id)?)?)
        }
        "brain.plugin.disable" => {
            let plugin_id = plugin_id_of(request)?;
            Ok(serde_json::to_value(state.plugins.disable(&plugin_id)?)?)
        }
        "brain.plugin.unregister" => {
            let plugin_id = plugin_id_of(request)?;
            state.plugins.unregister(&plugin_id)?;
            Ok(serde_json::json!({ "unregistered": plugin_id }))
        }

        other => Err(Error::Args(format!("unknown request type `{other}`"))),
    }
}

fn plugin_id_of(request: &Value) -> Result<String> {
    request
        .get("pluginId")
        .and_then(|p| p.as_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::Args("request needs `pluginId`".into()))
}

/// A plugin registered over the wire: it carries no code, only policy
/// overrides, so its whole effect set is declarative and reversible.
struct DeclarativePlugin {
    manifest: PluginManifest,
    policies: std::collections::HashMap<String, CapabilityPolicy>,
}

impl Plugin for DeclarativePlugin {
    fn manifest(&self) -> PluginManifest {
        self.manifest.clone()
    }

    fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let mut capabilities: Vec<&String> = self.policies.keys().collect();
        capabilities.sort();
        for capability in capabilities {
            ctx.push_policy(capability, self.policies[capability])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sk_domain::config::Config;

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.state_path = dir.path().join("data");
        let state = AppState::build(config, dir.path().join("skipper.toml")).unwrap();
        crate::runtime::register_default_providers(&state);
        (dir, state)
    }

    #[tokio::test]
    async fn unknown_type_is_e_args() {
        let (_dir, state) = test_state();
        let response =
            handle_request(&state, serde_json::json!({"type": "brain.nope", "id": 7})).await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["errorCode"], "E_ARGS");
        assert_eq!(response["id"], 7);
    }

    #[tokio::test]
    async fn session_lifecycle_over_the_channel() {
        let (_dir, state) = test_state();

        // Stopped-session start with autoRun=false records the prompt
        // but does not run.
        let created = handle_request(
            &state,
            serde_json::json!({"type": "brain.run.start", "prompt": "hello", "autoRun": false}),
        )
        .await;
        assert_eq!(created["ok"], true);
        let session_id = created["data"]["sessionId"].as_str().unwrap().to_owned();

        let list = handle_request(&state, serde_json::json!({"type": "brain.session.list"})).await;
        assert_eq!(list["data"]["sessions"].as_array().unwrap().len(), 1);

        let view = handle_request(
            &state,
            serde_json::json!({"type": "brain.session.view", "sessionId": session_id}),
        )
        .await;
        assert_eq!(view["data"]["entries"].as_array().unwrap().len(), 1);

        let deleted = handle_request(
            &state,
            serde_json::json!({"type": "brain.session.delete", "sessionId": session_id}),
        )
        .await;
        assert_eq!(deleted["ok"], true);

        let missing = handle_request(
            &state,
            serde_json::json!({"type": "brain.session.view", "sessionId": session_id}),
        )
        .await;
        assert_eq!(missing["errorCode"], "E_SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn declarative_plugin_round_trips_policies() {
        let (_dir, state) = test_state();

        let registered = handle_request(
            &state,
            serde_json::json!({
                "type": "brain.plugin.register",
                "manifest": {
                    "id": "strictifier",
                    "name": "Strictifier",
                    "version": "0.1.0",
                    "permissions": { "capabilities": ["browser.action"] }
                },
                "policies": {
                    "browser.action": {
                        "default_verify_policy": "always",
                        "lease_policy": "required",
                        "allow_script_fallback": false
                    }
                }
            }),
        )
        .await;
        assert_eq!(registered["ok"], true, "{registered}");

        handle_request(
            &state,
            serde_json::json!({"type": "brain.plugin.enable", "pluginId": "strictifier"}),
        )
        .await;
        assert!(!state.policies.effective("browser.action").allow_script_fallback);

        handle_request(
            &state,
            serde_json::json!({"type": "brain.plugin.disable", "pluginId": "strictifier"}),
        )
        .await;
        assert!(state.policies.effective("browser.action").allow_script_fallback);
    }

    #[tokio::test]
    async fn config_get_redacts_keys() {
        let (_dir, state) = test_state();
        {
            let mut config = state.config.write();
            config.llm.profiles = vec![sk_domain::config::LlmProfile {
                id: "p1".into(),
                provider: "openai_compat".into(),
                llm_api_base: "http://localhost/v1".into(),
                llm_api_key: "sk-secret".into(),
                llm_model: "small".into(),
                role: None,
                request_timeout_ms: 1000,
                retry_max_attempts: 1,
                retry_cap_delay_ms: 100,
            }];
        }
        let response = handle_request(&state, serde_json::json!({"type": "config.get"})).await;
        assert_eq!(response["data"]["llm"]["profiles"][0]["llm_api_key"], "***");
    }
}
