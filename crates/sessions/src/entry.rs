use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sk_domain::tool::{Role, ToolCall};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One element of a session's append-only log.
///
/// Timestamps are strictly monotonic within a log: the store bumps a
/// colliding timestamp forward on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Previous entry in the linear chain, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    Message {
        role: Role,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
    },
    /// An assistant-initiated pending call.
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    /// A compaction record: everything before `first_kept_entry_id` is
    /// represented by `summary` from here on.
    Compaction {
        summary: String,
        first_kept_entry_id: Option<String>,
        tokens_before: u64,
        tokens_after: u64,
        reason: String,
    },
}

impl Entry {
    pub fn is_compaction(&self) -> bool {
        matches!(self.kind, EntryKind::Compaction { .. })
    }

    /// The role, for message entries.
    pub fn role(&self) -> Option<Role> {
        match &self.kind {
            EntryKind::Message { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// The pending call, for tool_call entries.
    pub fn tool_call(&self) -> Option<ToolCall> {
        match &self.kind {
            EntryKind::ToolCall {
                call_id,
                tool_name,
                arguments,
            } => Some(ToolCall {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                arguments: arguments.clone(),
            }),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session header
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TitleSource {
    #[default]
    Auto,
    Manual,
}

/// Where a forked session came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkedFrom {
    pub session_id: String,
    /// Last entry copied into the fork.
    pub leaf_id: String,
    /// The entry the fork was requested against.
    pub source_entry_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub title_source: TitleSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<ForkedFrom>,
}

impl SessionHeader {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            title_source: TitleSource::Auto,
            created_at: now,
            updated_at: now,
            parent_session_id: None,
            forked_from: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_through_jsonl() {
        let entry = Entry {
            id: "e1".into(),
            timestamp: Utc::now(),
            parent_id: None,
            kind: EntryKind::ToolCall {
                call_id: "c1".into(),
                tool_name: "fs.read".into(),
                arguments: serde_json::json!({"path": "/tmp/a"}),
            },
        };
        let line = serde_json::to_string(&entry).unwrap();
        let back: Entry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn compaction_entry_is_tagged() {
        let entry = Entry {
            id: "e2".into(),
            timestamp: Utc::now(),
            parent_id: Some("e1".into()),
            kind: EntryKind::Compaction {
                summary: "earlier work".into(),
                first_kept_entry_id: Some("e9".into()),
                tokens_before: 1000,
                tokens_after: 120,
                reason: "threshold".into(),
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "compaction");
        assert!(entry.is_compaction());
    }
}
