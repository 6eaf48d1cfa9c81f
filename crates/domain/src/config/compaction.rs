use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context compaction config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Soft token threshold that triggers compaction before a send.
    /// Overflow reported by the model compacts regardless of this value.
    #[serde(default = "d_threshold")]
    pub threshold_tokens: u64,
    /// Minimum number of trailing messages kept out of the summary.
    #[serde(default = "d_keep_tail")]
    pub keep_tail: usize,
    /// Slide the cut forward so the kept tail starts on a user message
    /// (never splits an assistant+tool turn from the user that started it).
    #[serde(default = "d_true")]
    pub split_turn: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: d_threshold(),
            keep_tail: d_keep_tail(),
            split_turn: true,
        }
    }
}

fn d_threshold() -> u64 {
    96_000
}
fn d_keep_tail() -> usize {
    8
}
fn d_true() -> bool {
    true
}
