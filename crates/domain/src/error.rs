use serde::{Deserialize, Serialize};

/// Stable machine-readable error codes surfaced to clients.
///
/// Every user-visible failure carries one of these alongside a human
/// message. Codes are the contract; messages may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_ARGS")]
    Args,
    #[serde(rename = "E_AUTH")]
    Auth,
    #[serde(rename = "E_BUSY")]
    Busy,
    #[serde(rename = "E_BRIDGE_DISCONNECTED")]
    BridgeDisconnected,
    #[serde(rename = "E_RUNTIME_NOT_READY")]
    RuntimeNotReady,
    #[serde(rename = "E_SESSION_NOT_FOUND")]
    SessionNotFound,
    #[serde(rename = "E_ENTRY_NOT_FOUND")]
    EntryNotFound,
    #[serde(rename = "E_LOG_CORRUPT")]
    LogCorrupt,
    #[serde(rename = "E_VERIFY_FAILED")]
    VerifyFailed,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

impl ErrorCode {
    /// Fixed retryability mapping: transport, backpressure, and timeout
    /// failures may be retried with backoff; everything else surfaces
    /// to the caller immediately.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Busy | ErrorCode::BridgeDisconnected | ErrorCode::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Args => "E_ARGS",
            ErrorCode::Auth => "E_AUTH",
            ErrorCode::Busy => "E_BUSY",
            ErrorCode::BridgeDisconnected => "E_BRIDGE_DISCONNECTED",
            ErrorCode::RuntimeNotReady => "E_RUNTIME_NOT_READY",
            ErrorCode::SessionNotFound => "E_SESSION_NOT_FOUND",
            ErrorCode::EntryNotFound => "E_ENTRY_NOT_FOUND",
            ErrorCode::LogCorrupt => "E_LOG_CORRUPT",
            ErrorCode::VerifyFailed => "E_VERIFY_FAILED",
            ErrorCode::Timeout => "E_TIMEOUT",
            ErrorCode::Internal => "E_INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared error type used across all Skipper crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid arguments: {0}")]
    Args(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("bridge disconnected: {0}")]
    BridgeDisconnected(String),

    #[error("runtime not ready: {0}")]
    RuntimeNotReady(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("session log corrupt: {0}")]
    LogCorrupt(String),

    #[error("verification failed: {0}")]
    VerifyFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map to the stable wire code. Variants without a dedicated code
    /// collapse to `E_INTERNAL`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Args(_) => ErrorCode::Args,
            Error::Auth(_) => ErrorCode::Auth,
            Error::Busy(_) => ErrorCode::Busy,
            Error::BridgeDisconnected(_) => ErrorCode::BridgeDisconnected,
            Error::RuntimeNotReady(_) => ErrorCode::RuntimeNotReady,
            Error::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Error::EntryNotFound(_) => ErrorCode::EntryNotFound,
            Error::LogCorrupt(_) => ErrorCode::LogCorrupt,
            Error::VerifyFailed(_) => ErrorCode::VerifyFailed,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Io(_) | Error::Json(_) => ErrorCode::Internal,
            Error::Provider { .. } => ErrorCode::Internal,
            Error::Config(_) => ErrorCode::Args,
            Error::Other(_) => ErrorCode::Internal,
        }
    }

    pub fn retryable(&self) -> bool {
        self.code().retryable()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_mapping() {
        assert!(ErrorCode::Busy.retryable());
        assert!(ErrorCode::BridgeDisconnected.retryable());
        assert!(ErrorCode::Timeout.retryable());

        assert!(!ErrorCode::Args.retryable());
        assert!(!ErrorCode::Auth.retryable());
        assert!(!ErrorCode::VerifyFailed.retryable());
        assert!(!ErrorCode::RuntimeNotReady.retryable());
        assert!(!ErrorCode::SessionNotFound.retryable());
    }

    #[test]
    fn error_maps_to_code() {
        assert_eq!(Error::Args("bad".into()).code(), ErrorCode::Args);
        assert_eq!(
            Error::BridgeDisconnected("gone".into()).code(),
            ErrorCode::BridgeDisconnected
        );
        assert_eq!(Error::Other("?".into()).code(), ErrorCode::Internal);
    }

    #[test]
    fn code_serializes_to_wire_name() {
        let json = serde_json::to_string(&ErrorCode::BridgeDisconnected).unwrap();
        assert_eq!(json, "\"E_BRIDGE_DISCONNECTED\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::BridgeDisconnected);
    }
}
