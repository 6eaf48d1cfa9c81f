//! Agent fan-out: `brain.agent.run` spawns child sessions that run the
//! loop to completion and report their final message.
//!
//! `parallel` is capped at [`MAX_PARALLEL_TASKS`]; a parent stop
//! cascades into every child through the run-state stop groups.

use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::Value;

use sk_domain::error::{Error, Result};
use sk_domain::tool::Role;
use sk_sessions::entry::EntryKind;

use crate::runtime::run_loop::run_loop;
use crate::state::AppState;

/// Hard cap on parallel agent tasks.
pub const MAX_PARALLEL_TASKS: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentRunRequest {
    pub mode: AgentRunMode,
    /// Agent label recorded on the child sessions.
    pub agent: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub tasks: Option<Vec<String>>,
    /// Parent session the children hang off (stop cascades from it).
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRunMode {
    Single,
    Parallel,
}

pub async fn agent_run(state: &AppState, request: AgentRunRequest) -> Result<Value> {
    let tasks: Vec<String> = match (request.mode, &request.task, &request.tasks) {
        (AgentRunMode::Single, Some(task), _) => vec![task.clone()],
        (AgentRunMode::Single, None, _) => {
            return Err(Error::Args("mode=single needs `task`".into()));
        }
        (AgentRunMode::Parallel, _, Some(tasks)) if !tasks.is_empty() => tasks.clone(),
        (AgentRunMode::Parallel, _, _) => {
            return Err(Error::Args("mode=parallel needs a non-empty `tasks` list".into()));
        }
    };
    if tasks.len() > MAX_PARALLEL_TASKS {
        return Err(Error::Args(format!(
            "parallel agent run capped at {MAX_PARALLEL_TASKS} tasks (got {})",
            tasks.len()
        )));
    }

    // Resolve the parent; tasks run as child sessions under it.
    let parent_id = match &request.session_id {
        Some(id) if state.sessions.exists(id) => id.clone(),
        Some(id) => state.sessions.create(Some(id.clone()))?.id,
        None => state.sessions.create(None)?.id,
    };

    let mut children = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let child = state.sessions.create_child(&parent_id)?;
        state.runs.add_child(&parent_id, &child.id);
        state
            .sessions
            .append_message(&child.id, Role::User, task, None, None)?;
        children.push(child.id);
    }

    let futures: Vec<_> = children
        .iter()
        .map(|child_id| {
            let state = state.clone();
            let child_id = child_id.clone();
            async move {
                if !state.runs.try_begin_loop(&child_id) {
                    return (child_id, "failed".to_owned());
                }
                let status = run_loop(state, child_id.clone()).await;
                (child_id, status)
            }
        })
        .collect();
    let finished = join_all(futures).await;
    state.runs.clear_children(&parent_id);

    let mut results = Vec::with_capacity(finished.len());
    for (child_id, status) in finished {
        let output = final_assistant_text(state, &child_id)?;
        results.push(serde_json::json!({
            "sessionId": child_id,
            "agent": request.agent,
            "status": status,
            "output": output,
        }));
    }

    Ok(serde_json::json!({
        "sessionId": parent_id,
        "results": results,
    }))
}

fn final_assistant_text(state: &AppState, session_id: &str) -> Result<String> {
    let entries = state.sessions.entries(session_id)?;
    Ok(entries
        .iter()
        .rev()
        .find_map(|e| match &e.kind {
            EntryKind::Message {
                role: Role::Assistant,
                text,
                ..
            } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default())
}
