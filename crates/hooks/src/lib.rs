//! Hook chains: the extension points the kernel fires around tool
//! calls, LLM requests, compaction checks, and loop transitions.
//!
//! Handlers run in registration order. Each returns a verdict:
//! continue, patch (shallow-merged into the event envelope and visible
//! to later handlers), or block (short-circuits and aborts the
//! operation). Handler faults and timeouts are fail-open — the chain
//! continues as if the handler returned continue.

pub mod executor;
pub mod hook;
pub mod registry;

pub use executor::{run_chain, ChainOutcome};
pub use hook::{HookHandler, HookName, HookVerdict};
pub use registry::HookRegistry;
