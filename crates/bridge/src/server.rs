//! Bridge server: executes tool invokes with the dedup contract.
//!
//! `BridgeServerCore` is the transport-independent engine (dedup,
//! concurrency caps, events, audit); `BridgeServer` wires it to an
//! axum WebSocket endpoint.
//!
//! Dedup contract, keyed on `(id, sessionId)`:
//! - concurrent equal-args invokes join one execution, each response
//!   carrying its caller's own `agentId`;
//! - different args while in-flight or after success fail `E_ARGS`
//!   ("duplicate invoke id") — a cached result is never handed to a
//!   request that asked for something else;
//! - equal-args replay after success returns the cached response
//!   without re-executing;
//! - a failed execution releases the key so a retry can run.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::{broadcast, mpsc, oneshot};

use sk_bridge_protocol::{
    BridgeError, Frame, InvokeOutput, EVENT_INVOKE_FINISHED, EVENT_INVOKE_STARTED,
    EVENT_INVOKE_STDERR,
};

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, BridgeError>> + Send>>;
pub type ToolHandlerFn = Arc<dyn Fn(serde_json::Value) -> ToolFuture + Send + Sync>;

/// Named tool handlers the server is willing to execute. The concrete
/// command registry is supplied by the embedder.
#[derive(Default, Clone)]
pub struct ToolHandlerRegistry {
    handlers: Arc<Mutex<HashMap<String, ToolHandlerFn>>>,
}

impl ToolHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: ToolHandlerFn) {
        self.handlers.lock().insert(name.to_owned(), handler);
    }

    pub fn get(&self, name: &str) -> Option<ToolHandlerFn> {
        self.handlers.lock().get(name).cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub invoke_id: String,
    pub session_id: String,
    pub agent_id: Option<String>,
    pub tool: String,
    pub ok: bool,
    pub duration_ms: u64,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Injected audit sink. A failing logger never affects the invoke
/// outcome; the condition surfaces as an `invoke.stderr` event with
/// `source="audit"`.
pub trait AuditLogger: Send + Sync {
    fn log(&self, record: &AuditRecord) -> Result<(), String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type ExecResult = Result<serde_json::Value, BridgeError>;
type DedupKey = (String, String);

enum InvokeEntry {
    InFlight {
        args: serde_json::Value,
        waiters: Vec<oneshot::Sender<ExecResult>>,
    },
    Done {
        args: serde_json::Value,
        data: serde_json::Value,
    },
}

#[derive(Default)]
struct CoreState {
    entries: HashMap<DedupKey, InvokeEntry>,
    inflight_per_session: HashMap<String, usize>,
}

pub struct BridgeServerCore {
    tools: ToolHandlerRegistry,
    audit: Option<Arc<dyn AuditLogger>>,
    max_concurrency: usize,
    state: Mutex<CoreState>,
    events: broadcast::Sender<Frame>,
}

enum Action {
    Execute,
    Join(oneshot::Receiver<ExecResult>),
    Reply(ExecResult),
    Busy,
}

impl BridgeServerCore {
    pub fn new(
        tools: ToolHandlerRegistry,
        audit: Option<Arc<dyn AuditLogger>>,
        max_concurrency: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tools,
            audit,
            max_concurrency,
            state: Mutex::new(CoreState::default()),
            events,
        }
    }

    /// Subscribe to invoke lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Frame> {
        self.events.subscribe()
    }

    fn emit_event(&self, event: &str, id: Option<&str>, data: serde_json::Value) {
        let _ = self.events.send(Frame::Event {
            event: event.to_owned(),
            id: id.map(ToOwned::to_owned),
            data,
        });
    }

    fn duplicate_args_error() -> BridgeError {
        BridgeError::new("E_ARGS", "duplicate invoke id")
    }

    /// Handle one invoke frame end-to-end.
    pub async fn invoke(
        &self,
        id: &str,
        tool: &str,
        args: serde_json::Value,
        session_id: &str,
        agent_id: Option<String>,
    ) -> InvokeOutput {
        if !args.is_object() {
            return self.output(
                id,
                session_id,
                agent_id,
                Err(BridgeError::new("E_ARGS", "invoke args must be an object")),
            );
        }

        let key: DedupKey = (id.to_owned(), session_id.to_owned());

        let action = {
            let mut state = self.state.lock();
            let mut action = match state.entries.get_mut(&key) {
                Some(InvokeEntry::InFlight { args: held, waiters }) => {
                    if *held != args {
                        Action::Reply(Err(Self::duplicate_args_error()))
                    } else {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Action::Join(rx)
                    }
                }
                Some(InvokeEntry::Done { args: held, data }) => {
                    if *held != args {
                        Action::Reply(Err(Self::duplicate_args_error()))
                    } else {
                        Action::Reply(Ok(data.clone()))
                    }
                }
                None => Action::Execute,
            };

            // Claiming the key mutates the map, so it happens outside
            // the lookup above.
            if matches!(action, Action::Execute) {
                let inflight = state
                    .inflight_per_session
                    .get(session_id)
                    .copied()
                    .unwrap_or(0);
                if self.max_concurrency > 0 && inflight >= self.max_concurrency {
                    action = Action::Busy;
                } else {
                    state.entries.insert(
                        key.clone(),
                        InvokeEntry::InFlight {
                            args: args.clone(),
                            waiters: Vec::new(),
                        },
                    );
                    *state
                        .inflight_per_session
                        .entry(session_id.to_owned())
                        .or_insert(0) += 1;
                }
            }
            action
        };

        match action {
            Action::Busy => self.output(
                id,
                session_id,
                agent_id,
                Err(
                    BridgeError::new("E_BUSY", "session concurrency saturated").with_details(
                        serde_json::json!({ "logicalSessionId": session_id }),
                    ),
                ),
            ),
            Action::Reply(result) => self.output(id, session_id, agent_id, result),
            Action::Join(rx) => {
                let result = rx.await.unwrap_or_else(|_| {
                    Err(BridgeError::new(
                        "E_INTERNAL",
                        "execution dropped before completing",
                    ))
                });
                self.output(id, session_id, agent_id, result)
            }
            Action::Execute => {
                self.emit_event(
                    EVENT_INVOKE_STARTED,
                    Some(id),
                    serde_json::json!({ "tool": tool, "sessionId": session_id }),
                );
                let started = std::time::Instant::now();
                let result = self.execute(tool, args.clone()).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                // Finalize the dedup entry and wake joiners.
                let waiters = {
                    let mut state = self.state.lock();
                    let waiters = match state.entries.remove(&key) {
                        Some(InvokeEntry::InFlight { waiters, .. }) => waiters,
                        _ => Vec::new(),
                    };
                    if let Ok(data) = &result {
                        state.entries.insert(
                            key,
                            InvokeEntry::Done {
                                args,
                                data: data.clone(),
                            },
                        );
                    }
                    if let Some(count) = state.inflight_per_session.get_mut(session_id) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            state.inflight_per_session.remove(session_id);
                        }
                    }
                    waiters
                };
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }

                self.emit_event(
                    EVENT_INVOKE_FINISHED,
                    Some(id),
                    serde_json::json!({ "tool": tool, "sessionId": session_id, "ok": result.is_ok() }),
                );

                // Audit is a side channel; its failure is observable but
                // never poisons the invoke result.
                if let Some(audit) = &self.audit {
                    let record = AuditRecord {
                        invoke_id: id.to_owned(),
                        session_id: session_id.to_owned(),
                        agent_id: agent_id.clone(),
                        tool: tool.to_owned(),
                        ok: result.is_ok(),
                        duration_ms,
                        timestamp: Utc::now(),
                    };
                    if let Err(message) = audit.log(&record) {
                        tracing::warn!(invoke_id = %id, error = %message, "audit logger failed");
                        self.emit_event(
                            EVENT_INVOKE_STDERR,
                            Some(id),
                            serde_json::json!({
                                "source": "audit",
                                "sessionId": session_id,
                                "message": message,
                            }),
                        );
                    }
                }

                self.output(id, session_id, agent_id, result)
            }
        }
    }

    async fn execute(&self, tool: &str, args: serde_json::Value) -> ExecResult {
        let Some(handler) = self.tools.get(tool) else {
            return Err(BridgeError::new("E_ARGS", format!("unknown tool: {tool}")));
        };
        handler(args).await
    }

    fn output(
        &self,
        id: &str,
        session_id: &str,
        agent_id: Option<String>,
        result: ExecResult,
    ) -> InvokeOutput {
        match result {
            Ok(data) => InvokeOutput {
                id: id.to_owned(),
                ok: true,
                session_id: session_id.to_owned(),
                agent_id,
                data: Some(data),
                error: None,
            },
            Err(error) => InvokeOutput {
                id: id.to_owned(),
                ok: false,
                session_id: session_id.to_owned(),
                agent_id,
                data: None,
                error: Some(error),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct ServerState {
    core: Arc<BridgeServerCore>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub struct BridgeServer;

impl BridgeServer {
    /// Bind the bridge endpoint. `addr` may use port 0 for tests; the
    /// bound address is returned.
    pub async fn bind(
        addr: &str,
        core: Arc<BridgeServerCore>,
        token: Option<String>,
    ) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let app = Router::new()
            .route("/v1/bridge", get(bridge_ws))
            .with_state(ServerState { core, token });
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "bridge server exited");
            }
        });
        tracing::info!(addr = %local_addr, "bridge server listening");
        Ok((local_addr, handle))
    }
}

async fn bridge_ws(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Some(expected) = &state.token {
        let provided = query.token.as_deref().unwrap_or("");
        if !token_eq(provided, expected) {
            return (
                axum::http::StatusCode::UNAUTHORIZED,
                "invalid or missing bridge token",
            )
                .into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state.core))
        .into_response()
}

async fn handle_socket(socket: WebSocket, core: Arc<BridgeServerCore>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);

    // Writer task: serialized frames and outputs out to the socket.
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Event forwarder: lifecycle events to this connection.
    let mut events = core.subscribe_events();
    let event_tx = outbound_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Ok(frame) = events.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if event_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    // Reader loop.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Invoke {
                    id,
                    tool,
                    args,
                    session_id,
                    agent_id,
                    ..
                }) => {
                    let core = Arc::clone(&core);
                    let tx = outbound_tx.clone();
                    tokio::spawn(async move {
                        let output = core.invoke(&id, &tool, args, &session_id, agent_id).await;
                        if let Ok(text) = serde_json::to_string(&output) {
                            let _ = tx.send(text).await;
                        }
                    });
                }
                Ok(Frame::Ping { timestamp }) => {
                    let pong = Frame::Pong { timestamp };
                    if let Ok(text) = serde_json::to_string(&pong) {
                        let _ = outbound_tx.send(text).await;
                    }
                }
                Ok(Frame::Pong { .. }) => {}
                Ok(other) => {
                    tracing::debug!(frame = ?other, "ignoring unexpected inbound frame");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "failed to parse inbound frame");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    forwarder.abort();
    writer.abort();
    tracing::info!("bridge client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_registry() -> ToolHandlerRegistry {
        let tools = ToolHandlerRegistry::new();
        tools.register(
            "test.echo",
            Arc::new(|args| Box::pin(async move { Ok(args) })),
        );
        tools
    }

    #[tokio::test]
    async fn unknown_tool_is_e_args() {
        let core = BridgeServerCore::new(echo_registry(), None, 4);
        let output = core
            .invoke("i1", "nope", serde_json::json!({}), "s1", None)
            .await;
        assert!(!output.ok);
        assert_eq!(output.error.unwrap().code, "E_ARGS");
    }

    #[tokio::test]
    async fn array_args_rejected() {
        let core = BridgeServerCore::new(echo_registry(), None, 4);
        let output = core
            .invoke("i1", "test.echo", serde_json::json!([1, 2]), "s1", None)
            .await;
        assert!(!output.ok);
        assert_eq!(output.error.unwrap().code, "E_ARGS");
    }

    #[tokio::test]
    async fn cached_replay_with_original_args() {
        let core = BridgeServerCore::new(echo_registry(), None, 4);
        let args = serde_json::json!({"value": "a"});
        let first = core
            .invoke("c1", "test.echo", args.clone(), "s1", Some("a1".into()))
            .await;
        assert!(first.ok);

        // Different args after success: duplicate invoke id.
        let clash = core
            .invoke("c1", "test.echo", serde_json::json!({"value": "b"}), "s1", Some("agent-b".into()))
            .await;
        assert!(!clash.ok);
        let error = clash.error.unwrap();
        assert_eq!(error.code, "E_ARGS");
        assert!(error.message.contains("duplicate invoke id"));
        assert_eq!(clash.agent_id.as_deref(), Some("agent-b"));

        // Original args replay the cached response.
        let replay = core
            .invoke("c1", "test.echo", args, "s1", Some("a1".into()))
            .await;
        assert!(replay.ok);
        assert_eq!(replay.data.unwrap()["value"], "a");
    }

    #[tokio::test]
    async fn failed_execution_releases_the_key() {
        let tools = ToolHandlerRegistry::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);
        tools.register(
            "flaky",
            Arc::new(move |args| {
                let n = calls_ref.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async move {
                    if n == 0 {
                        Err(BridgeError::new("E_TIMEOUT", "first try times out"))
                    } else {
                        Ok(args)
                    }
                })
            }),
        );
        let core = BridgeServerCore::new(tools, None, 4);

        let args = serde_json::json!({"x": 1});
        let first = core.invoke("r1", "flaky", args.clone(), "s1", None).await;
        assert!(!first.ok);

        // Retry with the same id re-executes after failure.
        let second = core.invoke("r1", "flaky", args, "s1", None).await;
        assert!(second.ok);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn busy_when_session_saturated() {
        let tools = ToolHandlerRegistry::new();
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        tools.register(
            "test.delay.echo",
            Arc::new(move |args| {
                let mut release = release_rx.clone();
                Box::pin(async move {
                    while !*release.borrow() {
                        if release.changed().await.is_err() {
                            break;
                        }
                    }
                    Ok(args)
                })
            }),
        );
        let core = Arc::new(BridgeServerCore::new(tools, None, 1));

        let holder = {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                core.invoke("h1", "test.delay.echo", serde_json::json!({}), "s1", Some("holder".into()))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Second distinct invoke for the same logical session: E_BUSY.
        let busy = core
            .invoke("h2", "test.delay.echo", serde_json::json!({}), "s1", Some("later".into()))
            .await;
        assert!(!busy.ok);
        let error = busy.error.unwrap();
        assert_eq!(error.code, "E_BUSY");
        assert_eq!(error.details.unwrap()["logicalSessionId"], "s1");
        // The busy response names the current caller, not the holder.
        assert_eq!(busy.session_id, "s1");
        assert_eq!(busy.agent_id.as_deref(), Some("later"));

        release_tx.send(true).unwrap();
        let held = holder.await.unwrap();
        assert!(held.ok);
    }

    #[tokio::test]
    async fn audit_failure_is_side_channel_only() {
        struct FailingAudit;
        impl AuditLogger for FailingAudit {
            fn log(&self, _record: &AuditRecord) -> Result<(), String> {
                Err("disk full".into())
            }
        }

        let core = BridgeServerCore::new(echo_registry(), Some(Arc::new(FailingAudit)), 4);
        let mut events = core.subscribe_events();

        let output = core
            .invoke("a1", "test.echo", serde_json::json!({"k": 1}), "s1", None)
            .await;
        assert!(output.ok, "audit failure must not poison the invoke");

        let mut saw_audit_stderr = false;
        while let Ok(frame) = events.try_recv() {
            if let Frame::Event { event, data, .. } = frame {
                if event == EVENT_INVOKE_STDERR && data["source"] == "audit" {
                    saw_audit_stderr = true;
                }
            }
        }
        assert!(saw_audit_stderr);
    }
}
