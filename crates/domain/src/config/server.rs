use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kernel server config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_bind")]
    pub bind: String,
    /// Environment variable holding the API bearer token for the
    /// message channel. Unset env var = unauthenticated (dev mode).
    #[serde(default = "d_token_env")]
    pub token_env: String,
    /// Root directory for persisted state (sessions, vfs, archives).
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: d_bind(),
            token_env: d_token_env(),
            state_path: d_state_path(),
        }
    }
}

fn d_bind() -> String {
    "127.0.0.1:8970".into()
}
fn d_token_env() -> String {
    "SKIPPER_API_TOKEN".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
