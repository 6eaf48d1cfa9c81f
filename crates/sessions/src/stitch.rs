//! Send-time message stitching.
//!
//! Providers enforce a strict tool-calling wire contract: every tool
//! message must answer a `tool_calls` entry on a preceding assistant
//! message, and every pending call must eventually be answered. Logs
//! can violate both (interrupted loops, imported history), so the view
//! is stitched just before the send. Stitching is deterministic: the
//! same input always produces the same payload.

use sk_domain::tool::{Message, Role, ToolCall};

/// Placeholder content for a pending call that never got a result.
pub const NO_RESULT: &str = "No result provided";

/// Maximum call-id length accepted by providers.
const MAX_CALL_ID_LEN: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call id normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn id_char_ok(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn fnv1a(raw: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in raw.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Rewrite a call id to match `^[A-Za-z0-9_-]{1,64}$`.
///
/// Valid ids pass through untouched. Invalid ids are rewritten
/// deterministically (same input, same output) so an assistant call and
/// the tool message answering it stay paired after normalization.
pub fn normalize_call_id(raw: &str) -> String {
    let valid_len = !raw.is_empty() && raw.len() <= MAX_CALL_ID_LEN;
    if valid_len && raw.chars().all(id_char_ok) {
        return raw.to_owned();
    }

    let kept: String = raw.chars().filter(|c| id_char_ok(*c)).collect();
    let suffix = format!("{:08x}", fnv1a(raw) as u32);
    if kept.is_empty() {
        return format!("call_{suffix}");
    }
    let budget = MAX_CALL_ID_LEN - suffix.len() - 1;
    let head: String = kept.chars().take(budget).collect();
    format!("{head}_{suffix}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stitching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transform a conversation view into a wire-valid message sequence.
///
/// - Every tool message gets a preceding assistant `tool_calls` entry
///   with the same id (synthesized if missing).
/// - Every assistant pending call gets a following tool result
///   (synthesized as [`NO_RESULT`] if missing).
/// - All call ids are normalized via [`normalize_call_id`].
pub fn stitch_for_send(view: &[Message]) -> Vec<Message> {
    // Pass 1: normalize every call id in place.
    let mut messages: Vec<Message> = view
        .iter()
        .map(|m| {
            let mut m = m.clone();
            for call in &mut m.tool_calls {
                call.call_id = normalize_call_id(&call.call_id);
            }
            if let Some(id) = &m.tool_call_id {
                m.tool_call_id = Some(normalize_call_id(id));
            }
            m
        })
        .collect();

    // Pass 2: every tool message must be announced by an earlier
    // assistant tool_calls entry.
    let mut announced: Vec<String> = Vec::new();
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages.drain(..) {
        match message.role {
            Role::Assistant => {
                for call in &message.tool_calls {
                    announced.push(call.call_id.clone());
                }
                out.push(message);
            }
            Role::Tool => {
                if let Some(call_id) = message.tool_call_id.clone() {
                    if !announced.contains(&call_id) {
                        out.push(Message::assistant_with_calls(
                            "",
                            vec![ToolCall {
                                call_id: call_id.clone(),
                                tool_name: "tool".into(),
                                arguments: serde_json::json!({}),
                            }],
                        ));
                        announced.push(call_id);
                    }
                }
                out.push(message);
            }
            _ => out.push(message),
        }
    }

    // Pass 3: every announced call must be answered; synthesize results
    // immediately after the assistant message that carries the call.
    let answered: Vec<String> = out
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();

    let mut stitched: Vec<Message> = Vec::with_capacity(out.len());
    for message in out {
        let pending: Vec<String> = if message.role == Role::Assistant {
            message
                .tool_calls
                .iter()
                .map(|c| c.call_id.clone())
                .filter(|id| !answered.contains(id))
                .collect()
        } else {
            Vec::new()
        };
        stitched.push(message);
        for call_id in pending {
            stitched.push(Message::tool_result(call_id, NO_RESULT));
        }
    }

    stitched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids_pass_through() {
        assert_eq!(normalize_call_id("call_abc-123"), "call_abc-123");
    }

    #[test]
    fn invalid_ids_rewrite_deterministically() {
        let a = normalize_call_id("call:with spaces!");
        let b = normalize_call_id("call:with spaces!");
        assert_eq!(a, b);
        assert!(a.len() <= 64);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        assert!(a.starts_with("callwithspaces_"));
    }

    #[test]
    fn fully_invalid_id_gets_call_prefix() {
        let id = normalize_call_id("日本語");
        assert!(id.starts_with("call_"));
    }

    #[test]
    fn overlong_id_is_shortened() {
        let raw = "a".repeat(100);
        let id = normalize_call_id(&raw);
        assert!(id.len() <= 64);
        // Still deterministic.
        assert_eq!(id, normalize_call_id(&raw));
    }

    #[test]
    fn orphan_tool_message_gets_synthesized_assistant() {
        let view = vec![
            Message::user("go"),
            Message::tool_result("call_1", "output"),
        ];
        let stitched = stitch_for_send(&view);
        assert_eq!(stitched.len(), 3);
        assert_eq!(stitched[1].role, Role::Assistant);
        assert_eq!(stitched[1].content, "");
        assert_eq!(stitched[1].tool_calls[0].call_id, "call_1");
        assert_eq!(stitched[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn unanswered_call_gets_synthesized_result() {
        let view = vec![
            Message::user("go"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall {
                    call_id: "call_2".into(),
                    tool_name: "fs.read".into(),
                    arguments: serde_json::json!({}),
                }],
            ),
        ];
        let stitched = stitch_for_send(&view);
        assert_eq!(stitched.len(), 3);
        assert_eq!(stitched[2].role, Role::Tool);
        assert_eq!(stitched[2].content, NO_RESULT);
        assert_eq!(stitched[2].tool_call_id.as_deref(), Some("call_2"));
    }

    #[test]
    fn normalized_pair_stays_paired() {
        let raw_id = "call id with spaces";
        let view = vec![
            Message::assistant_with_calls(
                "",
                vec![ToolCall {
                    call_id: raw_id.into(),
                    tool_name: "fs.read".into(),
                    arguments: serde_json::json!({}),
                }],
            ),
            Message::tool_result(raw_id, "done"),
        ];
        let stitched = stitch_for_send(&view);
        assert_eq!(stitched.len(), 2);
        let assistant_id = &stitched[0].tool_calls[0].call_id;
        assert_eq!(stitched[1].tool_call_id.as_deref(), Some(assistant_id.as_str()));
        // No synthetic messages needed.
        assert_ne!(stitched[1].content, NO_RESULT);
    }

    #[test]
    fn stitching_is_idempotent_on_valid_input() {
        let view = vec![
            Message::user("go"),
            Message::assistant_with_calls(
                "on it",
                vec![ToolCall {
                    call_id: "c1".into(),
                    tool_name: "fs.read".into(),
                    arguments: serde_json::json!({}),
                }],
            ),
            Message::tool_result("c1", "ok"),
            Message::assistant("all done"),
        ];
        let once = stitch_for_send(&view);
        let twice = stitch_for_send(&once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), view.len());
    }
}
