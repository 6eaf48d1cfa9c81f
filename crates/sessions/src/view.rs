//! Conversation view: the derived projection of an entry log into a
//! send-ready message sequence.
//!
//! The view is a pure function of the log. The latest compaction's
//! summary is surfaced as a synthetic user-role preamble carrying
//! `<summary>` markers — user-role so providers never mistake it for
//! model output, and so providers that constrain system placement stay
//! compatible.

use sk_domain::tool::{Message, Role};

use crate::entry::{Entry, EntryKind};

/// Marker wrapping a compaction summary in the preamble.
pub const SUMMARY_OPEN: &str = "<summary>";
pub const SUMMARY_CLOSE: &str = "</summary>";

/// Project entries into messages. Scans from the latest compaction's
/// cut point forward; earlier entries are represented only by the
/// summary preamble.
pub fn build_conversation_view(entries: &[Entry]) -> Vec<Message> {
    let mut messages = Vec::new();

    let latest_compaction = entries
        .iter()
        .enumerate()
        .rev()
        .find(|(_, e)| e.is_compaction());

    let start = match latest_compaction {
        Some((idx, entry)) => {
            let EntryKind::Compaction {
                summary,
                first_kept_entry_id,
                ..
            } = &entry.kind
            else {
                unreachable!("is_compaction checked");
            };
            messages.push(Message::user(format!(
                "{SUMMARY_OPEN}\n{summary}\n{SUMMARY_CLOSE}"
            )));

            // Resume from the documented cut point when it still exists,
            // otherwise from just after the compaction record.
            first_kept_entry_id
                .as_deref()
                .and_then(|kept| entries.iter().position(|e| e.id == kept))
                .unwrap_or(idx + 1)
        }
        None => 0,
    };

    for entry in &entries[start..] {
        match &entry.kind {
            EntryKind::Compaction { .. } => {}
            EntryKind::Message {
                role,
                text,
                tool_call_id,
                ..
            } => match role {
                Role::Tool => {
                    // A tool message without its call id cannot be paired
                    // on the wire; drop it from the projection.
                    if let Some(call_id) = tool_call_id {
                        messages.push(Message::tool_result(call_id, text));
                    }
                }
                _ => {
                    messages.push(Message {
                        role: *role,
                        content: text.clone(),
                        tool_calls: Vec::new(),
                        tool_call_id: None,
                    });
                }
            },
            EntryKind::ToolCall { .. } => {
                let Some(call) = entry.tool_call() else {
                    continue;
                };
                // Fold pending calls into the assistant message that
                // initiated them when they are adjacent in the log.
                match messages.last_mut() {
                    Some(last) if last.role == Role::Assistant && last.tool_call_id.is_none() => {
                        last.tool_calls.push(call);
                    }
                    _ => {
                        messages.push(Message::assistant_with_calls("", vec![call]));
                    }
                }
            }
        }
    }

    messages
}
