//! The bridge lane: a single logical WebSocket between the kernel and
//! the local tool-execution server.
//!
//! `server` implements the execution side — request dedup keyed on
//! `(id, sessionId)`, per-session concurrency caps, lifecycle events,
//! and the audit side-channel. `client` implements the kernel side —
//! connection state machine, pending-invoke tracking, disconnect
//! semantics, and reconnect with jittered backoff.

pub mod client;
pub mod server;

pub use client::{BridgeLane, BridgeStatus, ConnectionState};
pub use server::{AuditLogger, AuditRecord, BridgeServer, BridgeServerCore, ToolHandlerRegistry};
