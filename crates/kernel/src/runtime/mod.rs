//! Kernel runtime: the per-session run loop and everything it leans
//! on — run state, events, compaction, step execution, agent fan-out,
//! and regenerate/fork plumbing.

pub mod agents;
pub mod compact;
pub mod events;
pub mod regenerate;
pub mod run_loop;
pub mod run_state;
pub mod steps;

use std::sync::Arc;

use sk_bridge_protocol::InvokeOutput;
use sk_browser::{CdpFacade, CdpTransport, SnapshotSource};
use sk_capability::{CapabilityInput, Mode, ProviderRecord};
use sk_domain::error::Error;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool name → capability routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map a canonical tool name onto the capability lane that executes it
/// and the action passed to the provider.
pub fn capability_for_tool(tool_name: &str) -> (String, String) {
    if tool_name == "browser.verify" {
        return ("browser.verify".into(), "verify".into());
    }
    if tool_name == "browser.snapshot" {
        return ("browser.snapshot".into(), "snapshot".into());
    }
    if let Some(verb) = tool_name.strip_prefix("browser.") {
        return ("browser.action".into(), verb.to_owned());
    }
    let action = tool_name
        .rsplit('.')
        .next()
        .unwrap_or(tool_name)
        .to_owned();
    (tool_name.to_owned(), action)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge-backed providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Translate a bridge output into the capability result shape,
/// mapping the error taxonomy onto the shared error type.
pub fn bridge_output_to_result(output: InvokeOutput) -> Result<serde_json::Value, Error> {
    if output.ok {
        return Ok(output.data.unwrap_or(serde_json::Value::Null));
    }
    let error = output
        .error
        .unwrap_or_else(|| sk_bridge_protocol::BridgeError::new("E_INTERNAL", "missing error"));
    let message = if let Some(details) = &error.details {
        format!("{} ({details})", error.message)
    } else {
        error.message.clone()
    };
    Err(match error.code.as_str() {
        "E_ARGS" => Error::Args(message),
        "E_AUTH" => Error::Auth(message),
        "E_BUSY" => Error::Busy(message),
        "E_BRIDGE_DISCONNECTED" => Error::BridgeDisconnected(message),
        "E_TIMEOUT" => Error::Timeout(message),
        "E_RUNTIME_NOT_READY" => Error::RuntimeNotReady(message),
        _ => Error::Other(message),
    })
}

/// Register the default capability providers: bridge-backed lanes for
/// local filesystem/shell tools and vfs-backed lanes for the virtual
/// namespaces. Browser capabilities arrive with the CDP transport.
pub fn register_default_providers(state: &AppState) {
    const BRIDGE_CAPABILITIES: [&str; 5] = [
        "fs.read",
        "fs.write",
        "fs.list",
        "process.exec",
        "process.status",
    ];
    for capability in BRIDGE_CAPABILITIES {
        let bridge = Arc::clone(&state.bridge);
        let tool = capability.to_owned();
        state.capabilities.add_provider(ProviderRecord {
            capability: capability.to_owned(),
            id: format!("bridge:{capability}"),
            mode: Mode::Bridge,
            priority: 0,
            can_handle: None,
            invoke: Arc::new(move |input: CapabilityInput| {
                let bridge = Arc::clone(&bridge);
                let tool = tool.clone();
                Box::pin(async move {
                    let invoke_id = input
                        .invoke_id
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                    let output = bridge
                        .invoke(
                            &invoke_id,
                            &tool,
                            input.args.clone(),
                            &input.session_id,
                            None,
                            None,
                        )
                        .await;
                    bridge_output_to_result(output)
                })
            }),
            plugin_id: None,
        });
    }

    // Virtual filesystem lanes run in-process.
    let vfs_read = Arc::clone(&state.vfs);
    state.capabilities.add_provider(ProviderRecord {
        capability: "fs.virtual.read".into(),
        id: "vfs:read".into(),
        mode: Mode::Custom,
        priority: 0,
        can_handle: None,
        invoke: Arc::new(move |input| {
            let vfs = Arc::clone(&vfs_read);
            Box::pin(async move {
                let uri = input
                    .args
                    .get("uri")
                    .and_then(|u| u.as_str())
                    .ok_or_else(|| Error::Args("fs.virtual.read needs `uri`".into()))?;
                let content = vfs.read(uri)?;
                Ok(serde_json::json!({ "uri": uri, "content": content }))
            })
        }),
        plugin_id: None,
    });

    let vfs_write = Arc::clone(&state.vfs);
    state.capabilities.add_provider(ProviderRecord {
        capability: "fs.virtual.write".into(),
        id: "vfs:write".into(),
        mode: Mode::Custom,
        priority: 0,
        can_handle: None,
        invoke: Arc::new(move |input| {
            let vfs = Arc::clone(&vfs_write);
            Box::pin(async move {
                let uri = input
                    .args
                    .get("uri")
                    .and_then(|u| u.as_str())
                    .ok_or_else(|| Error::Args("fs.virtual.write needs `uri`".into()))?;
                let content = input
                    .args
                    .get("content")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| Error::Args("fs.virtual.write needs `content`".into()))?;
                vfs.write(uri, content)?;
                Ok(serde_json::json!({ "uri": uri, "bytes": content.len() }))
            })
        }),
        plugin_id: None,
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CDP-backed providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn tab_of(input: &CapabilityInput) -> String {
    input
        .args
        .get("tabId")
        .and_then(|t| t.as_str())
        .unwrap_or("default")
        .to_owned()
}

/// Wire an injected CDP transport into the capability registry:
/// `browser.snapshot`, `browser.action`, and `browser.verify` run
/// through the lease- and binding-checked facade, and a `cdp`
/// mode-lane provider backs the legacy fallback path.
pub fn register_cdp_transport(state: &AppState, transport: Arc<dyn CdpTransport>) {
    let facade = Arc::new(CdpFacade::new(
        transport,
        Arc::clone(&state.leases),
        Arc::clone(&state.binder),
    ));

    let snapshot_facade = Arc::clone(&facade);
    state.capabilities.add_provider(ProviderRecord {
        capability: "browser.snapshot".into(),
        id: "cdp:snapshot".into(),
        mode: Mode::Cdp,
        priority: 0,
        can_handle: None,
        invoke: Arc::new(move |input| {
            let facade = Arc::clone(&snapshot_facade);
            Box::pin(async move {
                let tab = tab_of(&input);
                let source = match input.args.get("source").and_then(|s| s.as_str()) {
                    Some("dom") => SnapshotSource::Dom,
                    _ => SnapshotSource::Ax,
                };
                let snapshot = facade.snapshot(&tab, &input.session_id, source).await?;
                Ok(serde_json::to_value(snapshot)?)
            })
        }),
        plugin_id: None,
    });

    let action_facade = Arc::clone(&facade);
    let action_binder = Arc::clone(&state.binder);
    state.capabilities.add_provider(ProviderRecord {
        capability: "browser.action".into(),
        id: "cdp:action".into(),
        mode: Mode::Cdp,
        priority: 0,
        can_handle: None,
        invoke: Arc::new(move |input| {
            let facade = Arc::clone(&action_facade);
            let binder = Arc::clone(&action_binder);
            Box::pin(async move {
                let tab = tab_of(&input);
                // Refs bind to the generation they came from; absent an
                // explicit one the current generation is asserted.
                let generation = input
                    .args
                    .get("generation")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or_else(|| binder.current_generation(&tab));
                facade
                    .action(&tab, &input.session_id, generation, &input.action, &input.args)
                    .await
            })
        }),
        plugin_id: None,
    });

    let verify_facade = Arc::clone(&facade);
    state.capabilities.add_provider(ProviderRecord {
        capability: "browser.verify".into(),
        id: "cdp:verify".into(),
        mode: Mode::Cdp,
        priority: 0,
        can_handle: None,
        invoke: Arc::new(move |input| {
            let facade = Arc::clone(&verify_facade);
            Box::pin(async move {
                let tab = tab_of(&input);
                let expectation = input
                    .args
                    .get("expectation")
                    .and_then(|e| e.as_str())
                    .unwrap_or_default()
                    .to_owned();
                facade.verify(&tab, &input.session_id, &expectation).await
            })
        }),
        plugin_id: None,
    });

    // Legacy mode lane: the cdp side of the script→cdp fallback.
    let lane_facade = Arc::clone(&facade);
    let lane_binder = Arc::clone(&state.binder);
    state.capabilities.add_mode_provider(ProviderRecord {
        capability: String::new(),
        id: "cdp:mode-lane".into(),
        mode: Mode::Cdp,
        priority: 0,
        can_handle: None,
        invoke: Arc::new(move |input| {
            let facade = Arc::clone(&lane_facade);
            let binder = Arc::clone(&lane_binder);
            Box::pin(async move {
                let tab = tab_of(&input);
                let generation = input
                    .args
                    .get("generation")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or_else(|| binder.current_generation(&tab));
                facade
                    .action(&tab, &input.session_id, generation, &input.action, &input.args)
                    .await
            })
        }),
        plugin_id: None,
    });
}

pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_verbs_route_to_browser_action() {
        assert_eq!(
            capability_for_tool("browser.click"),
            ("browser.action".into(), "click".into())
        );
        assert_eq!(
            capability_for_tool("browser.verify"),
            ("browser.verify".into(), "verify".into())
        );
        assert_eq!(
            capability_for_tool("fs.read"),
            ("fs.read".into(), "read".into())
        );
        assert_eq!(
            capability_for_tool("process.exec"),
            ("process.exec".into(), "exec".into())
        );
    }

    #[test]
    fn bridge_errors_map_to_taxonomy() {
        let output = InvokeOutput {
            id: "i".into(),
            ok: false,
            session_id: "s".into(),
            agent_id: None,
            data: None,
            error: Some(sk_bridge_protocol::BridgeError::new("E_BUSY", "saturated")),
        };
        match bridge_output_to_result(output) {
            Err(Error::Busy(_)) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
        assert_eq!(truncate_str("h\u{00e9}llo", 2), "h...");
    }
}
