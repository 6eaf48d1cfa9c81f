//! End-to-end kernel scenarios: scripted LLM providers drive the real
//! run loop against the real session store, hook chains, and
//! capability registries.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use sk_capability::{Mode, ProviderRecord};
use sk_domain::config::{Config, LlmProfile};
use sk_domain::error::Error;
use sk_domain::tool::ToolCall;
use sk_kernel::api::channel::handle_request;
use sk_kernel::runtime::register_default_providers;
use sk_kernel::runtime::run_loop::{start_run, stop_run, StartRequest};
use sk_kernel::runtime::steps::{execute_step, StepRequest};
use sk_kernel::AppState;
use sk_providers::{ChatError, ChatErrorKind, ChatRequest, ChatResponse, LlmProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
enum Step {
    Content(&'static str),
    ToolCalls(Vec<ToolCall>),
    Overflow,
    Transport503,
    /// Sleep, then answer with content.
    SlowContent(u64, &'static str),
}

/// Pops one scripted step per chat call; an empty script answers
/// "done".
struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
        })
    }
}

fn content_response(text: &str) -> ChatResponse {
    ChatResponse {
        content: text.to_owned(),
        tool_calls: vec![],
        usage: None,
        model: "scripted".into(),
        finish_reason: Some("stop".into()),
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let step = self.script.lock().pop_front();
        match step {
            None | Some(Step::Content("done")) => Ok(content_response("done")),
            Some(Step::Content(text)) => Ok(content_response(text)),
            Some(Step::ToolCalls(calls)) => Ok(ChatResponse {
                content: String::new(),
                tool_calls: calls,
                usage: None,
                model: "scripted".into(),
                finish_reason: Some("tool_calls".into()),
            }),
            Some(Step::Overflow) => Err(ChatError {
                provider: "scripted".into(),
                kind: ChatErrorKind::Overflow,
                message: "maximum context length exceeded".into(),
                status: Some(400),
            }),
            Some(Step::Transport503) => Err(ChatError {
                provider: "scripted".into(),
                kind: ChatErrorKind::Transport,
                message: "503 service unavailable".into(),
                status: Some(503),
            }),
            Some(Step::SlowContent(ms, text)) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(content_response(text))
            }
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

/// A provider that fails on the basic profile's model and succeeds on
/// the pro profile's, for escalation scenarios.
struct TierSensitiveProvider;

#[async_trait::async_trait]
impl LlmProvider for TierSensitiveProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let model = req
            .model
            .clone()
            .or_else(|| req.target.as_ref().map(|t| t.model.clone()))
            .unwrap_or_default();
        if model == "basic-model" {
            Err(ChatError {
                provider: "tiered".into(),
                kind: ChatErrorKind::Transport,
                message: "503 service unavailable".into(),
                status: Some(503),
            })
        } else {
            Ok(content_response("answered by pro"))
        }
    }

    fn provider_id(&self) -> &str {
        "tiered"
    }
}

fn profile(id: &str, model: &str, role: &str) -> LlmProfile {
    LlmProfile {
        id: id.into(),
        provider: "openai_compat".into(),
        llm_api_base: "http://localhost:9/v1".into(),
        llm_api_key: "sk-test".into(),
        llm_model: model.into(),
        role: Some(role.into()),
        request_timeout_ms: 1_000,
        retry_max_attempts: 0,
        retry_cap_delay_ms: 100,
    }
}

fn test_state(provider: Arc<dyn LlmProvider>) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.state_path = dir.path().join("data");
    config.llm.profiles = vec![
        profile("worker.basic", "basic-model", "worker"),
        profile("worker.pro", "pro-model", "worker"),
    ];
    config.llm.default_profile = Some("worker.basic".into());
    config.llm.profile_chains.insert(
        "worker".into(),
        vec!["worker.basic".into(), "worker.pro".into()],
    );
    config.compaction.threshold_tokens = 1_000_000;
    config.compaction.keep_tail = 1;

    let state = AppState::build(config, dir.path().join("skipper.toml")).unwrap();
    register_default_providers(&state);
    state
        .llm
        .replace("openai_compat", provider)
        .expect("replace builtin adapter");
    (dir, state)
}

async fn wait_idle(state: &AppState, session_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !state.runs.snapshot(session_id).running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("loop finishes");
}

fn event_names(state: &AppState, session_id: &str) -> Vec<String> {
    let (events, _) = state.events.stream(session_id, None, None);
    events.iter().map(|e| e.event.name().to_owned()).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn overflow_triggers_compaction_then_continues() {
    let provider = ScriptedProvider::new(vec![Step::Overflow, Step::Content("recovered")]);
    let (_dir, state) = test_state(provider);

    let ack = start_run(
        &state,
        StartRequest {
            session_id: None,
            prompt: "hello".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: None,
        },
    )
    .unwrap();
    let session_id = ack["sessionId"].as_str().unwrap().to_owned();
    wait_idle(&state, &session_id).await;

    let names = event_names(&state, &session_id);
    for expected in [
        "auto_compaction_start",
        "session_compact",
        "auto_compaction_end",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {expected} in {names:?}");
    }
    assert!(names.iter().any(|n| n == "loop_done"));

    // The loop recovered and answered.
    let entries = state.sessions.entries(&session_id).unwrap();
    let view = state.sessions.conversation_view(&session_id).unwrap();
    assert!(entries.iter().any(|e| e.is_compaction()));
    assert_eq!(view.last().unwrap().content, "recovered");
}

#[tokio::test]
async fn script_mode_falls_back_to_cdp() {
    let (_dir, state) = test_state(ScriptedProvider::new(vec![]));

    state.capabilities.add_mode_provider(ProviderRecord {
        capability: String::new(),
        id: "script-lane".into(),
        mode: Mode::Script,
        priority: 0,
        can_handle: None,
        invoke: Arc::new(|_| {
            Box::pin(async { Err(Error::Other("script runtime unavailable".into())) })
        }),
        plugin_id: None,
    });
    state.capabilities.add_mode_provider(ProviderRecord {
        capability: String::new(),
        id: "cdp-lane".into(),
        mode: Mode::Cdp,
        priority: 0,
        can_handle: None,
        invoke: Arc::new(|_| {
            Box::pin(async { Ok(serde_json::json!({"ok": true, "source": "cdp"})) })
        }),
        plugin_id: None,
    });

    let result = execute_step(
        &state,
        StepRequest {
            session_id: "s1".into(),
            mode: Some("script".into()),
            capability: None,
            action: "click".into(),
            args: serde_json::json!({"ref": "e1"}),
            verify_policy: None,
            invoke_id: None,
        },
    )
    .await;

    assert!(result.ok, "{result:?}");
    assert_eq!(result.mode_used.as_deref(), Some("cdp"));
    assert_eq!(result.fallback_from.as_deref(), Some("script"));
    assert_eq!(result.data.unwrap()["source"], "cdp");
}

#[tokio::test]
async fn route_escalates_through_the_profile_chain() {
    let (_dir, state) = test_state(Arc::new(TierSensitiveProvider));

    let ack = start_run(
        &state,
        StartRequest {
            session_id: None,
            prompt: "do the thing".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: Some(serde_json::from_value(serde_json::json!({"role": "worker"})).unwrap()),
        },
    )
    .unwrap();
    let session_id = ack["sessionId"].as_str().unwrap().to_owned();
    wait_idle(&state, &session_id).await;

    let (events, _) = state.events.stream(&session_id, None, None);
    let names: Vec<&str> = events.iter().map(|e| e.event.name()).collect();

    let selected_basic = names.iter().position(|n| *n == "llm.route.selected").unwrap();
    let escalated = names.iter().position(|n| *n == "llm.route.escalated").unwrap();
    assert!(selected_basic < escalated);

    // The re-resolved route is marked as an escalation.
    let pro_selection = events.iter().find_map(|e| match &e.event {
        sk_domain::trace::TraceEvent::LlmRouteSelected {
            profile, source, ..
        } if profile == "worker.pro" => Some(source.clone()),
        _ => None,
    });
    assert_eq!(pro_selection.as_deref(), Some("escalation"));

    let done = events.iter().any(|e| {
        matches!(
            &e.event,
            sk_domain::trace::TraceEvent::LoopDone { status, .. } if status == "done"
        )
    });
    assert!(done, "loop finished done after escalation: {names:?}");

    let view = state.sessions.conversation_view(&session_id).unwrap();
    assert_eq!(view.last().unwrap().content, "answered by pro");
}

#[tokio::test]
async fn escalation_at_top_of_chain_fails_the_loop() {
    // The scripted provider fails both tiers.
    let (_dir, state) = test_state(ScriptedProvider::new(vec![
        Step::Transport503,
        Step::Transport503,
    ]));

    let ack = start_run(
        &state,
        StartRequest {
            session_id: None,
            prompt: "hi".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: Some(serde_json::from_value(serde_json::json!({"role": "worker"})).unwrap()),
        },
    )
    .unwrap();
    let session_id = ack["sessionId"].as_str().unwrap().to_owned();
    wait_idle(&state, &session_id).await;

    let run_state = state.runs.snapshot(&session_id);
    assert!(run_state.last_error.is_some());
    let names = event_names(&state, &session_id);
    assert!(names.iter().any(|n| n == "llm.route.escalated"));
}

#[tokio::test]
async fn stop_keeps_running_until_the_loop_observes_it() {
    // First call is slow with tool calls, so the loop has a second
    // iteration at which to observe the stop.
    let provider = ScriptedProvider::new(vec![Step::SlowContent(300, "late answer")]);
    let (_dir, state) = test_state(provider);

    let ack = start_run(
        &state,
        StartRequest {
            session_id: None,
            prompt: "long task".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: None,
        },
    )
    .unwrap();
    let session_id = ack["sessionId"].as_str().unwrap().to_owned();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Stop mid-flight: stopped latches, running stays true.
    let stopped = stop_run(&state, &session_id).unwrap();
    assert_eq!(stopped["stopped"], true);
    assert_eq!(stopped["running"], true);

    // A start in this window acknowledges without spawning a loop.
    let second = start_run(
        &state,
        StartRequest {
            session_id: Some(session_id.clone()),
            prompt: "another".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: None,
        },
    )
    .unwrap();
    assert_eq!(second["running"], true);
    assert_eq!(second["stopped"], true);

    wait_idle(&state, &session_id).await;

    // Exactly one loop ever started.
    let names = event_names(&state, &session_id);
    assert_eq!(names.iter().filter(|n| *n == "loop_start").count(), 1);

    // Start while stopped && !running with autoRun clears the latch
    // and runs again.
    let third = start_run(
        &state,
        StartRequest {
            session_id: Some(session_id.clone()),
            prompt: "resume".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: None,
        },
    )
    .unwrap();
    assert_eq!(third["running"], true);
    assert_eq!(third["stopped"], false);
    wait_idle(&state, &session_id).await;
}

#[tokio::test]
async fn running_loop_queues_steer_and_follow_up() {
    let provider = ScriptedProvider::new(vec![
        Step::SlowContent(200, "first answer"),
        Step::Content("steered answer"),
        Step::Content("followed answer"),
    ]);
    let (_dir, state) = test_state(provider);

    let ack = start_run(
        &state,
        StartRequest {
            session_id: None,
            prompt: "start".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: None,
        },
    )
    .unwrap();
    let session_id = ack["sessionId"].as_str().unwrap().to_owned();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A bare start against a running session is an argument error.
    let bare = start_run(
        &state,
        StartRequest {
            session_id: Some(session_id.clone()),
            prompt: "no behavior".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: None,
        },
    );
    assert!(matches!(bare, Err(Error::Args(_))));

    let follow = handle_request(
        &state,
        serde_json::json!({
            "type": "brain.run.follow_up",
            "sessionId": session_id,
            "prompt": "follow up",
        }),
    )
    .await;
    assert_eq!(follow["data"]["queued"], true);

    let steer = handle_request(
        &state,
        serde_json::json!({
            "type": "brain.run.steer",
            "sessionId": session_id,
            "prompt": "steer me",
        }),
    )
    .await;
    assert_eq!(steer["data"]["queued"], true);

    wait_idle(&state, &session_id).await;

    // The steer ran before the followUp.
    let view = state.sessions.conversation_view(&session_id).unwrap();
    let texts: Vec<&str> = view.iter().map(|m| m.content.as_str()).collect();
    let steer_pos = texts.iter().position(|t| *t == "steer me").unwrap();
    let follow_pos = texts.iter().position(|t| *t == "follow up").unwrap();
    assert!(steer_pos < follow_pos, "{texts:?}");
    assert_eq!(state.runs.snapshot(&session_id).queue.len(), 0);
}

#[tokio::test]
async fn parallel_agent_run_rejects_nine_tasks() {
    let (_dir, state) = test_state(ScriptedProvider::new(vec![]));
    let tasks: Vec<String> = (0..9).map(|i| format!("task {i}")).collect();

    let response = handle_request(
        &state,
        serde_json::json!({
            "type": "brain.agent.run",
            "mode": "parallel",
            "agent": "researcher",
            "tasks": tasks,
        }),
    )
    .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["errorCode"], "E_ARGS");
    assert!(response["error"].as_str().unwrap().contains("capped at 8"));
}

#[tokio::test]
async fn parallel_agent_run_collects_child_results() {
    let (_dir, state) = test_state(ScriptedProvider::new(vec![
        Step::Content("answer a"),
        Step::Content("answer b"),
    ]));

    let response = handle_request(
        &state,
        serde_json::json!({
            "type": "brain.agent.run",
            "mode": "parallel",
            "agent": "researcher",
            "tasks": ["task a", "task b"],
        }),
    )
    .await;
    assert_eq!(response["ok"], true, "{response}");
    let results = response["data"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result["status"], "done");
        assert!(result["output"].as_str().unwrap().starts_with("answer"));
    }

    // Children carry the parent linkage.
    let parent_id = response["data"]["sessionId"].as_str().unwrap();
    let children: Vec<_> = state
        .sessions
        .list()
        .into_iter()
        .filter(|h| h.parent_session_id.as_deref() == Some(parent_id))
        .collect();
    assert_eq!(children.len(), 2);
}

#[tokio::test]
async fn fork_preserves_the_source_session() {
    let (_dir, state) = test_state(ScriptedProvider::new(vec![]));
    let header = state.sessions.create(None).unwrap();
    let q1 = state
        .sessions
        .append_message(&header.id, sk_domain::tool::Role::User, "Q1", None, None)
        .unwrap();
    let a1 = state
        .sessions
        .append_message(&header.id, sk_domain::tool::Role::Assistant, "A1", None, None)
        .unwrap();
    state
        .sessions
        .append_message(&header.id, sk_domain::tool::Role::User, "Q2", None, None)
        .unwrap();
    state
        .sessions
        .append_message(&header.id, sk_domain::tool::Role::Assistant, "A2", None, None)
        .unwrap();

    let response = handle_request(
        &state,
        serde_json::json!({
            "type": "brain.session.fork",
            "sessionId": header.id,
            "sourceEntryId": a1.id,
            "leafId": q1.id,
            "reason": "branch",
        }),
    )
    .await;
    assert_eq!(response["ok"], true, "{response}");
    let fork_id = response["data"]["session"]["id"].as_str().unwrap();

    let fork_view = state.sessions.conversation_view(fork_id).unwrap();
    assert_eq!(fork_view.len(), 1);
    assert_eq!(fork_view[0].content, "Q1");

    // Source is untouched.
    assert_eq!(state.sessions.entries(&header.id).unwrap().len(), 4);
}

#[tokio::test]
async fn tool_calls_run_against_virtual_fs() {
    let provider = ScriptedProvider::new(vec![
        Step::ToolCalls(vec![ToolCall {
            call_id: "call_vfs_1".into(),
            tool_name: "fs.virtual.write".into(),
            arguments: serde_json::json!({"uri": "mem://notes/x.txt", "content": "hello vfs"}),
        }]),
        Step::Content("wrote it"),
    ]);
    let (_dir, state) = test_state(provider);

    let ack = start_run(
        &state,
        StartRequest {
            session_id: None,
            prompt: "write a note".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: None,
        },
    )
    .unwrap();
    let session_id = ack["sessionId"].as_str().unwrap().to_owned();
    wait_idle(&state, &session_id).await;

    assert_eq!(state.vfs.read("mem://notes/x.txt").unwrap(), "hello vfs");

    // The tool exchange landed in the log with matching call ids.
    let view = state.sessions.conversation_view(&session_id).unwrap();
    let tool_msg = view
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_vfs_1"))
        .expect("tool result in view");
    assert!(tool_msg.content.contains("mem://notes/x.txt"));
    assert_eq!(view.last().unwrap().content, "wrote it");
}

#[tokio::test]
async fn cdp_steps_enforce_lease_and_snapshot_binding() {
    use sk_browser::{CdpTransport, Snapshot, SnapshotSource};

    struct FakeTransport;

    #[async_trait::async_trait]
    impl CdpTransport for FakeTransport {
        async fn observe(&self, tab_id: &str) -> Result<serde_json::Value, Error> {
            Ok(serde_json::json!({"tab": tab_id}))
        }
        async fn snapshot(&self, tab_id: &str, source: SnapshotSource) -> Result<Snapshot, Error> {
            Ok(Snapshot {
                tab_id: tab_id.to_owned(),
                generation: 0,
                source,
                nodes: vec![],
                text: Some("page text".into()),
                truncated: false,
            })
        }
        async fn action(
            &self,
            _tab_id: &str,
            action: &str,
            _args: &serde_json::Value,
        ) -> Result<serde_json::Value, Error> {
            Ok(serde_json::json!({"did": action}))
        }
        async fn verify(
            &self,
            _tab_id: &str,
            _expectation: &str,
        ) -> Result<serde_json::Value, Error> {
            Ok(serde_json::json!({"verified": true}))
        }
    }

    let (_dir, state) = test_state(ScriptedProvider::new(vec![]));
    sk_kernel::runtime::register_cdp_transport(&state, Arc::new(FakeTransport));

    let step = |capability: &str, action: &str, session: &str, args: serde_json::Value| StepRequest {
        session_id: session.to_owned(),
        mode: None,
        capability: Some(capability.to_owned()),
        action: action.to_owned(),
        args,
        verify_policy: None,
        invoke_id: None,
    };

    // Snapshot establishes the lease and generation 1.
    let snapshot = execute_step(
        &state,
        step("browser.snapshot", "snapshot", "session-a", serde_json::json!({"tabId": "tab1"})),
    )
    .await;
    assert!(snapshot.ok, "{snapshot:?}");
    assert_eq!(snapshot.data.as_ref().unwrap()["generation"], 1);

    // An action bound to the current generation runs.
    let click = execute_step(
        &state,
        step(
            "browser.action",
            "click",
            "session-a",
            serde_json::json!({"tabId": "tab1", "generation": 1, "ref": "e1"}),
        ),
    )
    .await;
    assert!(click.ok, "{click:?}");

    // A stale generation is a binding failure; the step is not done.
    execute_step(
        &state,
        step("browser.snapshot", "snapshot", "session-a", serde_json::json!({"tabId": "tab1"})),
    )
    .await;
    let stale = execute_step(
        &state,
        step(
            "browser.action",
            "click",
            "session-a",
            serde_json::json!({"tabId": "tab1", "generation": 1, "ref": "e1"}),
        ),
    )
    .await;
    assert!(!stale.ok);
    assert!(stale.error.unwrap().contains("stale snapshot ref"));

    // Another session hits the lease.
    let locked = execute_step(
        &state,
        step(
            "browser.action",
            "click",
            "session-b",
            serde_json::json!({"tabId": "tab1", "generation": 2}),
        ),
    )
    .await;
    assert!(!locked.ok);
    assert_eq!(locked.error_code.as_deref(), Some("E_BUSY"));
    assert!(locked.error.unwrap().contains("locked_by_other"));
}

#[tokio::test]
async fn step_stream_returns_truncated_window() {
    let provider = ScriptedProvider::new(vec![Step::Content("hi")]);
    let (_dir, state) = test_state(provider);

    let ack = start_run(
        &state,
        StartRequest {
            session_id: None,
            prompt: "hello".into(),
            auto_run: true,
            streaming_behavior: None,
            session_options: None,
        },
    )
    .unwrap();
    let session_id = ack["sessionId"].as_str().unwrap().to_owned();
    wait_idle(&state, &session_id).await;

    let response = handle_request(
        &state,
        serde_json::json!({
            "type": "brain.step.stream",
            "sessionId": session_id,
            "maxEvents": 2,
        }),
    )
    .await;
    assert_eq!(response["ok"], true);
    let meta = &response["data"]["streamMeta"];
    assert_eq!(meta["returnedEvents"], 2);
    assert_eq!(meta["truncated"], true);
    assert!(meta["totalEvents"].as_u64().unwrap() > 2);
}
