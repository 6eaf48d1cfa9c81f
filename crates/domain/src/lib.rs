//! Shared domain types for all Skipper crates.
//!
//! Everything on a wire or in a store goes through the types here: the
//! error taxonomy with stable codes, provider-agnostic messages and tool
//! calls, the TOML configuration model, and structured trace events.

pub mod backoff;
pub mod config;
pub mod error;
pub mod tool;
pub mod trace;

pub use error::{Error, ErrorCode, Result};
