//! Process-local run state per session: the running/stopped flags, the
//! steer/followUp queue, and the profile-chain position.
//!
//! Entries persist; run state does not — a kernel restart resets it.
//!
//! Stop boundary: `stop` sets `stopped=true` and drains the queue, but
//! only the loop clears `running` when it exits cleanly. A `start`
//! while `stopped && running` never spawns a second loop.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBehavior {
    Steer,
    FollowUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedPrompt {
    pub id: String,
    pub behavior: QueueBehavior,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub running: bool,
    pub stopped: bool,
    pub queue: VecDeque<QueuedPrompt>,
    pub chain_position: usize,
    pub last_error: Option<String>,
    /// Route options carried from `brain.run.start` sessionOptions.
    pub role: Option<String>,
    pub profile: Option<String>,
}

#[derive(Default)]
pub struct RunStateMap {
    states: Mutex<HashMap<String, RunState>>,
    /// parent session -> child sessions, for cascading stop.
    groups: Mutex<HashMap<String, Vec<String>>>,
}

impl RunStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, session_id: &str, f: impl FnOnce(&mut RunState) -> R) -> R {
        let mut states = self.states.lock();
        let state = states.entry(session_id.to_owned()).or_default();
        f(state)
    }

    pub fn snapshot(&self, session_id: &str) -> RunState {
        self.with(session_id, |s| s.clone())
    }

    /// Try to take ownership of the loop. Returns false when a loop is
    /// already running (the caller must queue instead).
    pub fn try_begin_loop(&self, session_id: &str) -> bool {
        self.with(session_id, |s| {
            if s.running {
                false
            } else {
                s.running = true;
                s.last_error = None;
                true
            }
        })
    }

    /// The loop observed its exit point; only here does `running` drop.
    pub fn finish_loop(&self, session_id: &str) {
        self.with(session_id, |s| {
            s.running = false;
        });
    }

    pub fn is_stopped(&self, session_id: &str) -> bool {
        self.with(session_id, |s| s.stopped)
    }

    /// Mark stopped and drain the queue. The running flag is left for
    /// the loop to clear at its next observation point. Stop cascades
    /// to registered child sessions.
    pub fn stop(&self, session_id: &str) -> RunState {
        let state = self.with(session_id, |s| {
            s.stopped = true;
            s.queue.clear();
            s.clone()
        });
        let children = self
            .groups
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        for child in children {
            self.with(&child, |s| {
                s.stopped = true;
                s.queue.clear();
            });
        }
        state
    }

    /// Register a child session in a parent's stop group.
    pub fn add_child(&self, parent_id: &str, child_id: &str) {
        self.groups
            .lock()
            .entry(parent_id.to_owned())
            .or_default()
            .push(child_id.to_owned());
    }

    /// Drop a parent's stop group (called when fan-out completes).
    pub fn clear_children(&self, parent_id: &str) {
        self.groups.lock().remove(parent_id);
    }

    /// Clear the stopped latch (start with `autoRun=true`).
    pub fn clear_stopped(&self, session_id: &str) {
        self.with(session_id, |s| {
            s.stopped = false;
        });
    }

    /// Queue a prompt: steer jumps to head, followUp appends to tail.
    pub fn enqueue(&self, session_id: &str, behavior: QueueBehavior, text: &str) -> QueuedPrompt {
        let prompt = QueuedPrompt {
            id: uuid::Uuid::new_v4().to_string(),
            behavior,
            text: text.to_owned(),
        };
        self.with(session_id, |s| match behavior {
            QueueBehavior::Steer => s.queue.push_front(prompt.clone()),
            QueueBehavior::FollowUp => s.queue.push_back(prompt.clone()),
        });
        prompt
    }

    /// Reclassify a queued followUp as steer (moves to head). Unknown
    /// ids are a no-op; the current state is returned either way.
    pub fn promote(&self, session_id: &str, prompt_id: &str) -> RunState {
        self.with(session_id, |s| {
            if let Some(position) = s.queue.iter().position(|p| p.id == prompt_id) {
                if let Some(mut prompt) = s.queue.remove(position) {
                    prompt.behavior = QueueBehavior::Steer;
                    s.queue.push_front(prompt);
                }
            }
            s.clone()
        })
    }

    pub fn pop_next(&self, session_id: &str) -> Option<QueuedPrompt> {
        self.with(session_id, |s| s.queue.pop_front())
    }

    pub fn record_error(&self, session_id: &str, error: &str) {
        self.with(session_id, |s| {
            s.last_error = Some(error.to_owned());
        });
    }

    pub fn set_route_options(
        &self,
        session_id: &str,
        role: Option<String>,
        profile: Option<String>,
    ) {
        self.with(session_id, |s| {
            if role.is_some() {
                s.role = role;
            }
            if profile.is_some() {
                s.profile = profile;
            }
        });
    }

    pub fn set_chain_position(&self, session_id: &str, position: usize) {
        self.with(session_id, |s| {
            s.chain_position = position;
        });
    }

    pub fn chain_position(&self, session_id: &str) -> usize {
        self.with(session_id, |s| s.chain_position)
    }

    /// All session ids with any run state (for the debug surface).
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steer_goes_to_head_follow_up_to_tail() {
        let runs = RunStateMap::new();
        runs.enqueue("s1", QueueBehavior::FollowUp, "first follow");
        runs.enqueue("s1", QueueBehavior::FollowUp, "second follow");
        let steer = runs.enqueue("s1", QueueBehavior::Steer, "urgent");

        let state = runs.snapshot("s1");
        assert_eq!(state.queue.len(), 3);
        assert_eq!(state.queue[0].id, steer.id);
        assert_eq!(state.queue[1].text, "first follow");
    }

    #[test]
    fn promote_moves_follow_up_to_head() {
        let runs = RunStateMap::new();
        runs.enqueue("s1", QueueBehavior::FollowUp, "a");
        let target = runs.enqueue("s1", QueueBehavior::FollowUp, "b");

        let state = runs.promote("s1", &target.id);
        assert_eq!(state.queue[0].id, target.id);
        assert_eq!(state.queue[0].behavior, QueueBehavior::Steer);
    }

    #[test]
    fn promote_unknown_id_is_a_noop() {
        let runs = RunStateMap::new();
        runs.enqueue("s1", QueueBehavior::FollowUp, "a");
        let state = runs.promote("s1", "no-such-id");
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].behavior, QueueBehavior::FollowUp);
    }

    #[test]
    fn stop_drains_queue_but_keeps_running() {
        let runs = RunStateMap::new();
        assert!(runs.try_begin_loop("s1"));
        runs.enqueue("s1", QueueBehavior::FollowUp, "queued");

        let state = runs.stop("s1");
        assert!(state.stopped);
        assert!(state.running, "only the loop clears running");
        assert!(state.queue.is_empty());
    }

    #[test]
    fn second_begin_loop_refused_while_running() {
        let runs = RunStateMap::new();
        assert!(runs.try_begin_loop("s1"));
        assert!(!runs.try_begin_loop("s1"));
        runs.finish_loop("s1");
        assert!(runs.try_begin_loop("s1"));
    }
}
