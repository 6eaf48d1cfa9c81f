//! Context compaction — collapses an entry-log prefix into a summary
//! so the conversation stays within the model's window.
//!
//! Everything here is a pure function over entry slices; the loop
//! appends the resulting compaction record (never rewrites) and the
//! conversation view picks it up from the log.

use std::future::Future;

use sk_domain::error::Result;
use sk_domain::tool::Role;
use sk_sessions::entry::{Entry, EntryKind};

/// Crude token estimate: characters / 4. Overflow reported by the
/// model is authoritative regardless of this number.
pub fn estimate_tokens(entries: &[Entry]) -> u64 {
    let chars: usize = entries
        .iter()
        .map(|e| match &e.kind {
            EntryKind::Message { text, .. } => text.len(),
            EntryKind::ToolCall { arguments, .. } => arguments.to_string().len(),
            EntryKind::Compaction { summary, .. } => summary.len(),
        })
        .sum();
    (chars / 4) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactReason {
    Overflow,
    Threshold,
    Manual,
}

impl CompactReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CompactReason::Overflow => "overflow",
            CompactReason::Threshold => "threshold",
            CompactReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShouldCompact {
    pub should_compact: bool,
    pub reason: Option<CompactReason>,
}

/// Decide whether to compact. Overflow is authoritative: it compacts
/// even when the measured size sits below the soft threshold.
pub fn should_compact(entries: &[Entry], threshold_tokens: u64, overflow: bool) -> ShouldCompact {
    if overflow {
        return ShouldCompact {
            should_compact: true,
            reason: Some(CompactReason::Overflow),
        };
    }
    if estimate_tokens(entries) > threshold_tokens {
        return ShouldCompact {
            should_compact: true,
            reason: Some(CompactReason::Threshold),
        };
    }
    ShouldCompact {
        should_compact: false,
        reason: None,
    }
}

/// Index of the first active entry: past the latest compaction's cut.
fn active_start(entries: &[Entry]) -> usize {
    let Some((idx, entry)) = entries
        .iter()
        .enumerate()
        .rev()
        .find(|(_, e)| e.is_compaction())
    else {
        return 0;
    };
    let EntryKind::Compaction {
        first_kept_entry_id, ..
    } = &entry.kind
    else {
        return 0;
    };
    first_kept_entry_id
        .as_deref()
        .and_then(|kept| entries.iter().position(|e| e.id == kept))
        .unwrap_or(idx + 1)
}

fn is_user_message(entry: &Entry) -> bool {
    matches!(
        entry.kind,
        EntryKind::Message {
            role: Role::User,
            ..
        }
    )
}

/// Find the cut point: the index (into `entries`) of the first kept
/// entry. Walks from the end keeping at least `keep_tail` entries;
/// with `split_turn` the cut slides forward until the first kept entry
/// is a user message, so an assistant+tool run never loses the user
/// turn that started it.
pub fn find_cut_point(entries: &[Entry], keep_tail: usize, split_turn: bool) -> usize {
    let start = active_start(entries);
    let active: Vec<usize> = (start..entries.len())
        .filter(|i| !entries[*i].is_compaction())
        .collect();

    if active.len() <= keep_tail {
        return active.first().copied().unwrap_or(entries.len());
    }

    let mut cut = active.len() - keep_tail;
    if split_turn {
        // Slide back toward older entries to the user message that
        // opened the turn containing the initial cut.
        let mut candidate = cut;
        loop {
            if is_user_message(&entries[active[candidate]]) {
                cut = candidate;
                break;
            }
            if candidate == 0 {
                // No user message at or before the cut; slide forward
                // to the next user turn instead.
                if let Some(forward) =
                    (cut..active.len()).find(|i| is_user_message(&entries[active[*i]]))
                {
                    cut = forward;
                }
                break;
            }
            candidate -= 1;
        }
    }

    active[cut]
}

#[derive(Debug, Clone)]
pub struct Preparation {
    pub dropped: Vec<Entry>,
    pub kept: Vec<Entry>,
    pub first_kept_entry_id: Option<String>,
    /// The previous compaction's summary, carried through.
    pub previous_summary: Option<String>,
    pub tokens_before: u64,
    pub tokens_after: u64,
    /// True when the cut lands mid-turn: the dropped tail then holds
    /// the earlier messages of a turn whose remainder is kept.
    pub split_inside_turn: bool,
}

/// Prepare a compaction. Pure and idempotent over
/// `(entries, previous_summary, keep_tail, split_turn)`.
pub fn prepare_compaction(
    entries: &[Entry],
    previous_summary: Option<&str>,
    keep_tail: usize,
    split_turn: bool,
) -> Preparation {
    let start = active_start(entries);
    let previous_summary = previous_summary.map(ToOwned::to_owned).or_else(|| {
        entries.iter().rev().find_map(|e| match &e.kind {
            EntryKind::Compaction { summary, .. } => Some(summary.clone()),
            _ => None,
        })
    });

    let cut = find_cut_point(entries, keep_tail, split_turn);
    let dropped: Vec<Entry> = entries[start..cut.max(start)]
        .iter()
        .filter(|e| !e.is_compaction())
        .cloned()
        .collect();
    let kept: Vec<Entry> = entries[cut..]
        .iter()
        .filter(|e| !e.is_compaction())
        .cloned()
        .collect();

    let split_inside_turn = kept.first().map_or(false, |first| !is_user_message(first));

    Preparation {
        tokens_before: estimate_tokens(entries),
        tokens_after: estimate_tokens(&kept),
        first_kept_entry_id: kept.first().map(|e| e.id.clone()),
        previous_summary,
        dropped,
        kept,
        split_inside_turn,
    }
}

/// What the summarizer is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeMode {
    History,
    TurnPrefix,
}

impl SummarizeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SummarizeMode::History => "history",
            SummarizeMode::TurnPrefix => "turn_prefix",
        }
    }
}

pub struct SummarizeRequest {
    pub mode: SummarizeMode,
    pub entries: Vec<Entry>,
    pub previous_summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    pub first_kept_entry_id: Option<String>,
    pub tokens_before: u64,
    pub tokens_after: u64,
}

/// Produce the final combined summary for a prepared compaction.
///
/// When the cut fell inside a turn, the partial turn's dropped prefix
/// is summarized separately (`turn_prefix`) and concatenated after the
/// history summary so the kept turn's earlier messages survive.
pub async fn compact<F, Fut>(
    preparation: &Preparation,
    mut summarize: F,
) -> Result<CompactionOutcome>
where
    F: FnMut(SummarizeRequest) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let (history_slice, turn_prefix_slice) = if preparation.split_inside_turn {
        // The partial turn starts at the last user message of the
        // dropped range; everything from there on belongs to the turn
        // whose remainder is kept.
        let turn_start = preparation
            .dropped
            .iter()
            .rposition(|e| is_user_message(e))
            .unwrap_or(preparation.dropped.len());
        preparation.dropped.split_at(turn_start)
    } else {
        (&preparation.dropped[..], &[][..])
    };

    let mut summary = summarize(SummarizeRequest {
        mode: SummarizeMode::History,
        entries: history_slice.to_vec(),
        previous_summary: preparation.previous_summary.clone(),
    })
    .await?;

    if !turn_prefix_slice.is_empty() {
        let turn_summary = summarize(SummarizeRequest {
            mode: SummarizeMode::TurnPrefix,
            entries: turn_prefix_slice.to_vec(),
            previous_summary: None,
        })
        .await?;
        if !turn_summary.is_empty() {
            summary.push_str("\n\n");
            summary.push_str(&turn_summary);
        }
    }

    Ok(CompactionOutcome {
        summary,
        first_kept_entry_id: preparation.first_kept_entry_id.clone(),
        tokens_before: preparation.tokens_before,
        tokens_after: preparation.tokens_after,
    })
}

/// Deterministic extractive fallback for when no summarizer is
/// reachable: headline lines from each dropped message.
pub fn extractive_summary(entries: &[Entry], previous_summary: Option<&str>) -> String {
    let mut lines = Vec::new();
    if let Some(previous) = previous_summary {
        lines.push(previous.to_owned());
    }
    for entry in entries {
        let (label, text) = match &entry.kind {
            EntryKind::Message { role, text, .. } => {
                let label = match role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                    Role::Tool => "Tool",
                    Role::System => "System",
                };
                (label, text.as_str())
            }
            EntryKind::ToolCall { tool_name, .. } => ("Call", tool_name.as_str()),
            EntryKind::Compaction { .. } => continue,
        };
        let first_line = text.lines().next().unwrap_or("");
        let headline: String = first_line.chars().take(120).collect();
        if !headline.is_empty() {
            lines.push(format!("{label}: {headline}"));
        }
    }
    lines.join("\n")
}
