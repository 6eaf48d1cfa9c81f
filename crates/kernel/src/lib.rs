//! The orchestrator kernel: message API, per-session run loops,
//! compaction, step execution, and the event fabric that ties the
//! session store, provider runtime, and bridge lane together.

pub mod api;
pub mod config_io;
pub mod runtime;
pub mod state;

pub use state::AppState;
