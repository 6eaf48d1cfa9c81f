//! Snapshot generation binding.
//!
//! Every snapshot of a tab gets a monotonically increasing generation;
//! element refs bind to the generation they came from. Actions carrying
//! refs from an older generation are rejected with a binding failure
//! (the step is not marked done), and after an explicit target switch
//! nothing executes until a fresh snapshot of the new tab is taken.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sk_domain::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Ax,
    Dom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    #[serde(rename = "ref")]
    pub node_ref: String,
    pub role: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tab_id: String,
    pub generation: u64,
    pub source: SnapshotSource,
    pub nodes: Vec<SnapshotNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

#[derive(Debug, Clone)]
struct ActiveTarget {
    tab_id: String,
    snapshot_taken: bool,
}

#[derive(Default)]
pub struct SnapshotBinder {
    generations: Mutex<HashMap<String, u64>>,
    active: Mutex<Option<ActiveTarget>>,
}

impl SnapshotBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicitly switch the active target tab. Execution stays
    /// rejected until a fresh snapshot of that tab is recorded.
    pub fn switch_target(&self, tab_id: &str) {
        *self.active.lock() = Some(ActiveTarget {
            tab_id: tab_id.to_owned(),
            snapshot_taken: false,
        });
    }

    /// Record a new snapshot of a tab; returns its generation.
    pub fn record_snapshot(&self, tab_id: &str) -> u64 {
        let mut generations = self.generations.lock();
        let generation = generations.entry(tab_id.to_owned()).or_insert(0);
        *generation += 1;

        let mut active = self.active.lock();
        match active.as_mut() {
            Some(target) if target.tab_id == tab_id => target.snapshot_taken = true,
            Some(_) => {}
            None => {
                *active = Some(ActiveTarget {
                    tab_id: tab_id.to_owned(),
                    snapshot_taken: true,
                });
            }
        }
        *generation
    }

    pub fn current_generation(&self, tab_id: &str) -> u64 {
        self.generations.lock().get(tab_id).copied().unwrap_or(0)
    }

    /// Validate that an action bound to `(tab_id, generation)` may run.
    pub fn check_binding(&self, tab_id: &str, generation: u64) -> Result<()> {
        let active = self.active.lock();
        let Some(target) = active.as_ref() else {
            return Err(Error::Args(
                "no snapshot taken yet; take a snapshot before acting".into(),
            ));
        };
        if target.tab_id != tab_id {
            return Err(Error::Args(format!(
                "cross-tab execution rejected: active target is `{}`; switch targets and take a fresh snapshot",
                target.tab_id
            )));
        }
        if !target.snapshot_taken {
            return Err(Error::Args(format!(
                "target `{tab_id}` switched but not yet snapshotted; take a fresh snapshot first"
            )));
        }
        drop(active);

        let current = self.current_generation(tab_id);
        if generation != current {
            return Err(Error::Args(format!(
                "stale snapshot ref: bound to generation {generation}, tab is at {current}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_snapshot_binds() {
        let binder = SnapshotBinder::new();
        let generation = binder.record_snapshot("tab1");
        assert!(binder.check_binding("tab1", generation).is_ok());
    }

    #[test]
    fn stale_ref_rejected_after_new_snapshot() {
        let binder = SnapshotBinder::new();
        let old = binder.record_snapshot("tab1");
        binder.record_snapshot("tab1");

        let err = binder.check_binding("tab1", old).unwrap_err();
        assert!(err.to_string().contains("stale snapshot ref"));
    }

    #[test]
    fn cross_tab_rejected_until_fresh_snapshot() {
        let binder = SnapshotBinder::new();
        let g1 = binder.record_snapshot("tab1");

        binder.switch_target("tab2");
        // The old tab's refs no longer execute.
        assert!(binder.check_binding("tab1", g1).is_err());
        // And the new tab is unusable until snapshotted.
        assert!(binder.check_binding("tab2", 0).is_err());

        let g2 = binder.record_snapshot("tab2");
        assert!(binder.check_binding("tab2", g2).is_ok());
    }

    #[test]
    fn acting_without_any_snapshot_is_rejected() {
        let binder = SnapshotBinder::new();
        assert!(binder.check_binding("tab1", 0).is_err());
    }
}
