//! Session persistence: append-only entry logs, headers, and the index.
//!
//! Each session is an ordered, append-only log of entries persisted in
//! sharded JSONL pages. The conversation view is a pure projection of
//! the log plus the latest compaction summary; it is never materialized
//! to disk. Message stitching normalizes the view into a send-ready
//! sequence that satisfies the tool-calling wire contract.

pub mod entry;
pub mod kv;
pub mod stitch;
pub mod store;
pub mod view;

pub use entry::{Entry, EntryKind, ForkedFrom, SessionHeader, TitleSource};
pub use kv::KvStore;
pub use store::SessionStore;
pub use view::build_conversation_view;
