//! Kernel-side bridge lane.
//!
//! Maintains the single logical WebSocket to the tool-execution
//! server: `disconnected → connecting → connected → closing →
//! disconnected`. In-flight invokes are tracked in a pending list; a
//! disconnect rejects them with retryable `E_BRIDGE_DISCONNECTED`,
//! while a response delivered before the close completes succeeds
//! normally. Reconnects use jittered exponential backoff and
//! `bridge.status` is broadcast to interested listeners.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use sk_bridge_protocol::{BridgeError, Frame, InvokeOutput, ServerMessage};
use sk_domain::backoff::Backoff;
use sk_domain::config::BridgeConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Full connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// The condensed status broadcast to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Connected,
    Disconnected,
}

impl BridgeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeStatus::Connected => "connected",
            BridgeStatus::Disconnected => "disconnected",
        }
    }
}

struct PendingInvoke {
    invoke_id: String,
    agent_id: Option<String>,
    session_id: String,
    tx: oneshot::Sender<InvokeOutput>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lane
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BridgeLane {
    url: String,
    token: Option<String>,
    invoke_timeout: Duration,
    backoff: Backoff,
    heartbeat: Duration,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    pending: Mutex<VecDeque<PendingInvoke>>,
    status_tx: broadcast::Sender<BridgeStatus>,
    events_tx: broadcast::Sender<Frame>,
}

impl BridgeLane {
    pub fn from_config(config: &BridgeConfig, token: Option<String>) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            url: config.url.clone(),
            token,
            invoke_timeout: Duration::from_secs(config.invoke_timeout_secs),
            backoff: Backoff::from_bounds(config.reconnect_initial_ms, config.reconnect_cap_ms),
            heartbeat: Duration::from_secs(30),
            state: Mutex::new(ConnectionState::Disconnected),
            outbound: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            status_tx,
            events_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<BridgeStatus> {
        self.status_tx.subscribe()
    }

    /// Lifecycle events (`invoke.started`, `invoke.stderr`, …) forwarded
    /// from the server.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Frame> {
        self.events_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn connect_url(&self) -> String {
        let sep = if self.url.contains('?') { "&" } else { "?" };
        match &self.token {
            Some(token) => format!("{}{sep}token={token}", self.url),
            None => self.url.clone(),
        }
    }

    // ── Invokes ────────────────────────────────────────────────────

    fn local_failure(
        id: &str,
        session_id: &str,
        agent_id: Option<String>,
        code: &str,
        message: &str,
    ) -> InvokeOutput {
        InvokeOutput {
            id: id.to_owned(),
            ok: false,
            session_id: session_id.to_owned(),
            agent_id,
            data: None,
            error: Some(BridgeError::new(code, message)),
        }
    }

    /// Send one invoke and wait for its output. Transport-level
    /// failures are shaped like server outputs so callers handle one
    /// result type; `error.retryable()` annotates each uniformly.
    pub async fn invoke(
        &self,
        id: &str,
        tool: &str,
        args: serde_json::Value,
        session_id: &str,
        parent_session_id: Option<String>,
        agent_id: Option<String>,
    ) -> InvokeOutput {
        let Some(outbound) = self.outbound.lock().clone() else {
            return Self::local_failure(
                id,
                session_id,
                agent_id,
                "E_BRIDGE_DISCONNECTED",
                "bridge is not connected",
            );
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(PendingInvoke {
            invoke_id: id.to_owned(),
            agent_id: agent_id.clone(),
            session_id: session_id.to_owned(),
            tx,
        });

        let frame = Frame::Invoke {
            id: id.to_owned(),
            tool: tool.to_owned(),
            args,
            session_id: session_id.to_owned(),
            parent_session_id,
            agent_id: agent_id.clone(),
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                self.remove_pending(id, agent_id.as_deref());
                return Self::local_failure(
                    id,
                    session_id,
                    agent_id,
                    "E_ARGS",
                    &format!("unserializable invoke: {e}"),
                );
            }
        };
        if outbound.send(text).await.is_err() {
            self.remove_pending(id, agent_id.as_deref());
            return Self::local_failure(
                id,
                session_id,
                agent_id,
                "E_BRIDGE_DISCONNECTED",
                "bridge connection closed while sending",
            );
        }

        match tokio::time::timeout(self.invoke_timeout, rx).await {
            Ok(Ok(output)) => output,
            Ok(Err(_)) => Self::local_failure(
                id,
                session_id,
                agent_id,
                "E_BRIDGE_DISCONNECTED",
                "bridge connection lost",
            ),
            Err(_) => {
                self.remove_pending(id, agent_id.as_deref());
                Self::local_failure(
                    id,
                    session_id,
                    agent_id,
                    "E_TIMEOUT",
                    &format!("invoke timed out after {}s", self.invoke_timeout.as_secs()),
                )
            }
        }
    }

    fn remove_pending(&self, invoke_id: &str, agent_id: Option<&str>) -> Option<PendingInvoke> {
        let mut pending = self.pending.lock();
        let position = pending
            .iter()
            .position(|p| p.invoke_id == invoke_id && p.agent_id.as_deref() == agent_id)
            .or_else(|| pending.iter().position(|p| p.invoke_id == invoke_id))?;
        pending.remove(position)
    }

    /// Abort outstanding invokes for a session (kernel stop semantics).
    /// Each resolves with a cancellation error rather than hanging.
    pub fn abort_invokes_by_session(&self, session_id: &str) -> usize {
        let aborted: Vec<PendingInvoke> = {
            let mut pending = self.pending.lock();
            let mut kept = VecDeque::with_capacity(pending.len());
            let mut taken = Vec::new();
            while let Some(entry) = pending.pop_front() {
                if entry.session_id == session_id {
                    taken.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *pending = kept;
            taken
        };

        let count = aborted.len();
        for entry in aborted {
            let output = Self::local_failure(
                &entry.invoke_id,
                &entry.session_id,
                entry.agent_id.clone(),
                "E_INTERNAL",
                "invoke aborted by session stop",
            );
            let _ = entry.tx.send(output);
        }
        if count > 0 {
            tracing::info!(session_id, aborted = count, "aborted bridge invokes");
        }
        count
    }

    fn fail_all_pending(&self, message: &str) -> usize {
        let drained: Vec<PendingInvoke> = self.pending.lock().drain(..).collect();
        let count = drained.len();
        for entry in drained {
            let output = Self::local_failure(
                &entry.invoke_id,
                &entry.session_id,
                entry.agent_id.clone(),
                "E_BRIDGE_DISCONNECTED",
                message,
            );
            let _ = entry.tx.send(output);
        }
        count
    }

    // ── Connection loop ────────────────────────────────────────────

    /// Run the lane. Connects, pumps messages, and reconnects with
    /// backoff until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            match tokio_tungstenite::connect_async(self.connect_url()).await {
                Ok((ws, _response)) => {
                    attempt = 0;
                    self.pump_connection(ws, &shutdown).await;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "bridge connect failed");
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(delay_ms = delay.as_millis() as u64, attempt, "bridge reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn pump_connection(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        shutdown: &CancellationToken,
    ) {
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        *self.outbound.lock() = Some(outbound_tx.clone());
        self.set_state(ConnectionState::Connected);
        let _ = self.status_tx.send(BridgeStatus::Connected);
        tracing::info!(url = %self.url, "bridge connected");

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Heartbeat pings keep the logical connection observable.
        let ping_tx = outbound_tx.clone();
        let heartbeat = self.heartbeat;
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            interval.tick().await; // skip the immediate tick
            loop {
                interval.tick().await;
                let ping = Frame::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                let Ok(text) = serde_json::to_string(&ping) else {
                    continue;
                };
                if ping_tx.send(text).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(&text, &outbound_tx).await,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "bridge read error");
                        break;
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }

        self.set_state(ConnectionState::Closing);
        *self.outbound.lock() = None;
        ping_task.abort();
        writer.abort();
        // Anything still pending was not answered before the close.
        let failed = self.fail_all_pending("bridge connection lost");
        self.set_state(ConnectionState::Disconnected);
        let _ = self.status_tx.send(BridgeStatus::Disconnected);
        tracing::warn!(failed_in_flight = failed, "bridge disconnected");
    }

    async fn handle_text(&self, text: &str, outbound: &mpsc::Sender<String>) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Output(output)) => {
                match self.remove_pending(&output.id, output.agent_id.as_deref()) {
                    Some(entry) => {
                        let _ = entry.tx.send(output);
                    }
                    None => {
                        tracing::warn!(invoke_id = %output.id, "output for unknown invoke");
                    }
                }
            }
            Ok(ServerMessage::Control(Frame::Event { event, id, data })) => {
                let _ = self.events_tx.send(Frame::Event { event, id, data });
            }
            Ok(ServerMessage::Control(Frame::Ping { timestamp })) => {
                let pong = Frame::Pong { timestamp };
                if let Ok(text) = serde_json::to_string(&pong) {
                    let _ = outbound.send(text).await;
                }
            }
            Ok(ServerMessage::Control(_)) => {}
            Err(e) => {
                tracing::debug!(error = %e, "failed to parse bridge message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane() -> BridgeLane {
        BridgeLane::from_config(&BridgeConfig::default(), Some("secret".into()))
    }

    #[test]
    fn connect_url_appends_token() {
        let lane = lane();
        assert!(lane.connect_url().ends_with("?token=secret"));
    }

    #[tokio::test]
    async fn invoke_while_disconnected_fails_retryable() {
        let lane = lane();
        let output = lane
            .invoke("i1", "fs.read", serde_json::json!({}), "s1", None, None)
            .await;
        assert!(!output.ok);
        let error = output.error.unwrap();
        assert_eq!(error.code, "E_BRIDGE_DISCONNECTED");
        assert!(error.retryable());
    }

    #[tokio::test]
    async fn abort_by_session_resolves_only_that_session() {
        let lane = lane();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        lane.pending.lock().push_back(PendingInvoke {
            invoke_id: "a".into(),
            agent_id: None,
            session_id: "s1".into(),
            tx: tx1,
        });
        lane.pending.lock().push_back(PendingInvoke {
            invoke_id: "b".into(),
            agent_id: None,
            session_id: "s2".into(),
            tx: tx2,
        });

        assert_eq!(lane.abort_invokes_by_session("s1"), 1);

        let aborted = rx1.await.unwrap();
        assert!(!aborted.ok);
        assert!(aborted.error.unwrap().message.contains("aborted"));

        // The other session's invoke is untouched.
        assert!(rx2.try_recv().is_err());
        assert_eq!(lane.pending.lock().len(), 1);
    }

    #[tokio::test]
    async fn pending_matches_by_agent_id() {
        let lane = lane();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        lane.pending.lock().push_back(PendingInvoke {
            invoke_id: "dup-1".into(),
            agent_id: Some("a1".into()),
            session_id: "s".into(),
            tx: tx1,
        });
        lane.pending.lock().push_back(PendingInvoke {
            invoke_id: "dup-1".into(),
            agent_id: Some("a2".into()),
            session_id: "s".into(),
            tx: tx2,
        });

        // Output for the second agent resolves the second waiter.
        let output = InvokeOutput {
            id: "dup-1".into(),
            ok: true,
            session_id: "s".into(),
            agent_id: Some("a2".into()),
            data: Some(serde_json::json!(2)),
            error: None,
        };
        let entry = lane.remove_pending(&output.id, output.agent_id.as_deref()).unwrap();
        let _ = entry.tx.send(output);

        assert_eq!(rx2.await.unwrap().agent_id.as_deref(), Some("a2"));
        assert!(rx1.try_recv().is_err());
    }
}
