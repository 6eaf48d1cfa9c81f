//! Regenerate and edit-rerun: re-running a conversation from an
//! earlier point without ever rewriting the append-only log.
//!
//! Both operations fork when history would otherwise need rewriting:
//! the fork copies the prefix up to the chosen leaf, the source
//! session is untouched.

use serde::Deserialize;
use serde_json::Value;

use sk_domain::error::{Error, Result};
use sk_domain::tool::Role;
use sk_sessions::entry::{Entry, EntryKind};

use crate::runtime::run_loop::run_loop;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct RegenerateRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "sourceEntryId")]
    pub source_entry_id: String,
    #[serde(rename = "requireSourceIsLeaf", default)]
    pub require_source_is_leaf: bool,
    #[serde(rename = "rebaseLeafToPreviousUser", default)]
    pub rebase_leaf_to_previous_user: bool,
    #[serde(rename = "autoRun", default = "default_true")]
    pub auto_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditRerunRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "sourceEntryId")]
    pub source_entry_id: String,
    pub prompt: String,
}

fn default_true() -> bool {
    true
}

fn is_user(entry: &Entry) -> bool {
    matches!(
        entry.kind,
        EntryKind::Message {
            role: Role::User,
            ..
        }
    )
}

fn spawn_loop(state: &AppState, session_id: &str) -> bool {
    if !state.runs.try_begin_loop(session_id) {
        return false;
    }
    let task_state = state.clone();
    let task_session = session_id.to_owned();
    tokio::spawn(async move {
        run_loop(task_state, task_session).await;
    });
    true
}

/// `brain.run.regenerate`: fork just before an assistant response and
/// run the loop on the fork so the model answers again.
pub fn regenerate(state: &AppState, request: RegenerateRequest) -> Result<Value> {
    let entries = state.sessions.entries(&request.session_id)?;
    let source_pos = entries
        .iter()
        .position(|e| e.id == request.source_entry_id)
        .ok_or_else(|| Error::EntryNotFound(request.source_entry_id.clone()))?;

    if !matches!(
        entries[source_pos].kind,
        EntryKind::Message {
            role: Role::Assistant,
            ..
        }
    ) {
        return Err(Error::Args(
            "regenerate source must be an assistant message".into(),
        ));
    }
    if request.require_source_is_leaf && source_pos != entries.len() - 1 {
        return Err(Error::Args("source entry is not the session leaf".into()));
    }
    if source_pos == 0 {
        return Err(Error::Args("nothing precedes the source entry".into()));
    }

    // Leaf of the fork: the previous user turn when rebasing,
    // otherwise whatever immediately precedes the source.
    let leaf_pos = if request.rebase_leaf_to_previous_user {
        entries[..source_pos]
            .iter()
            .rposition(is_user)
            .ok_or_else(|| Error::Args("no user entry precedes the source".into()))?
    } else {
        source_pos - 1
    };

    let fork = state.sessions.fork(
        &request.session_id,
        &request.source_entry_id,
        &entries[leaf_pos].id,
        "regenerate",
    )?;

    let running = request.auto_run && spawn_loop(state, &fork.id);
    Ok(serde_json::json!({
        "sessionId": fork.id,
        "forkedFrom": request.session_id,
        "running": running,
    }))
}

/// `brain.run.edit_rerun`: an edited prompt against the latest user
/// turn retries in place; against a historical user turn it forks.
pub fn edit_rerun(state: &AppState, request: EditRerunRequest) -> Result<Value> {
    let entries = state.sessions.entries(&request.session_id)?;
    let source_pos = entries
        .iter()
        .position(|e| e.id == request.source_entry_id)
        .ok_or_else(|| Error::EntryNotFound(request.source_entry_id.clone()))?;

    if !is_user(&entries[source_pos]) {
        return Err(Error::Args("edit_rerun source must be a user message".into()));
    }

    let latest_user_pos = entries.iter().rposition(is_user);
    let is_latest_user = latest_user_pos == Some(source_pos);

    if is_latest_user {
        // Retry: the edited prompt continues the same session.
        state
            .sessions
            .append_message(&request.session_id, Role::User, &request.prompt, None, None)?;
        let running = spawn_loop(state, &request.session_id);
        return Ok(serde_json::json!({
            "sessionId": request.session_id,
            "forked": false,
            "running": running,
        }));
    }

    // Historical: fork just before the edited turn, then run with the
    // new prompt.
    if source_pos == 0 {
        return Err(Error::Args("cannot fork before the first entry".into()));
    }
    let fork = state.sessions.fork(
        &request.session_id,
        &request.source_entry_id,
        &entries[source_pos - 1].id,
        "edit_rerun",
    )?;
    state
        .sessions
        .append_message(&fork.id, Role::User, &request.prompt, None, None)?;
    let running = spawn_loop(state, &fork.id);

    Ok(serde_json::json!({
        "sessionId": fork.id,
        "forked": true,
        "forkedFrom": request.session_id,
        "running": running,
    }))
}
