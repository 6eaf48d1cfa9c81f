use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge (local tool-execution server) config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// WebSocket URL of the local tool-execution server.
    #[serde(default = "d_url")]
    pub url: String,
    /// Environment variable holding the pre-shared bridge token.
    /// Unset env var = unauthenticated (dev mode).
    #[serde(default = "d_token_env")]
    pub token_env: String,
    /// Concurrent invokes allowed per logical session on the server.
    #[serde(default = "d_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-invoke timeout.
    #[serde(default = "d_invoke_timeout")]
    pub invoke_timeout_secs: u64,
    /// Initial reconnect delay.
    #[serde(default = "d_reconnect_initial")]
    pub reconnect_initial_ms: u64,
    /// Cap on the reconnect delay.
    #[serde(default = "d_reconnect_cap")]
    pub reconnect_cap_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: d_url(),
            token_env: d_token_env(),
            max_concurrency: d_max_concurrency(),
            invoke_timeout_secs: d_invoke_timeout(),
            reconnect_initial_ms: d_reconnect_initial(),
            reconnect_cap_ms: d_reconnect_cap(),
        }
    }
}

fn d_url() -> String {
    "ws://127.0.0.1:8971/v1/bridge".into()
}
fn d_token_env() -> String {
    "SKIPPER_BRIDGE_TOKEN".into()
}
fn d_max_concurrency() -> usize {
    4
}
fn d_invoke_timeout() -> u64 {
    120
}
fn d_reconnect_initial() -> u64 {
    250
}
fn d_reconnect_cap() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BridgeConfig::default();
        assert!(config.url.starts_with("ws://"));
        assert!(config.max_concurrency > 0);
        assert!(config.reconnect_cap_ms >= config.reconnect_initial_ms);
    }
}
