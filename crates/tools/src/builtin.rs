//! The builtin contract set: filesystem, shell, virtual filesystem,
//! and the closed browser-automation verb surface.

use serde_json::json;

use crate::contract::{ContractSource, RuntimeHint, ToolContract};

fn builtin(
    name: &str,
    description: &str,
    parameters: serde_json::Value,
    runtime: Option<RuntimeHint>,
) -> ToolContract {
    ToolContract {
        canonical_name: name.into(),
        description: description.into(),
        parameters,
        aliases: Vec::new(),
        source: ContractSource::Builtin,
        runtime,
    }
}

/// Element-targeting schema fragment: a target is addressed by
/// snapshot `uid`, snapshot `ref`, or raw CDP `backendNodeId`.
fn element_target_properties() -> serde_json::Value {
    json!({
        "uid": { "type": "string", "description": "Stable element uid from the latest snapshot" },
        "ref": { "type": "string", "description": "Ref number from the latest snapshot (e.g. \"e12\")" },
        "backendNodeId": { "type": "integer", "description": "CDP backend node id" }
    })
}

fn element_target_any_of() -> serde_json::Value {
    json!([
        { "required": ["uid"] },
        { "required": ["ref"] },
        { "required": ["backendNodeId"] }
    ])
}

/// All builtin contracts, in a stable order.
pub fn builtin_contracts() -> Vec<ToolContract> {
    vec![
        // ── Filesystem (via bridge) ────────────────────────────────
        builtin(
            "fs.read",
            "Read a file from the local filesystem.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "offset": { "type": "integer", "minimum": 0 },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"]
            }),
            Some(RuntimeHint::Local),
        ),
        builtin(
            "fs.write",
            "Write content to a file on the local filesystem, creating it if needed.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                    "append": { "type": "boolean", "default": false }
                },
                "required": ["path", "content"]
            }),
            Some(RuntimeHint::Local),
        ),
        builtin(
            "fs.list",
            "List directory entries on the local filesystem.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "recursive": { "type": "boolean", "default": false }
                },
                "required": ["path"]
            }),
            Some(RuntimeHint::Local),
        ),
        // ── Virtual filesystem (in-browser) ────────────────────────
        builtin(
            "fs.virtual.read",
            "Read a file from the virtual in-browser filesystem (mem:// or vfs://).",
            json!({
                "type": "object",
                "properties": {
                    "uri": { "type": "string", "pattern": "^(mem|vfs)://" }
                },
                "required": ["uri"]
            }),
            Some(RuntimeHint::Browser),
        ),
        builtin(
            "fs.virtual.write",
            "Write a file into the virtual in-browser filesystem (mem:// or vfs://).",
            json!({
                "type": "object",
                "properties": {
                    "uri": { "type": "string", "pattern": "^(mem|vfs)://" },
                    "content": { "type": "string" }
                },
                "required": ["uri", "content"]
            }),
            Some(RuntimeHint::Browser),
        ),
        // ── Shell (via bridge) ─────────────────────────────────────
        builtin(
            "process.exec",
            "Run a shell command on the local machine and return its output.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "cwd": { "type": "string" },
                    "timeout_secs": { "type": "integer", "minimum": 1, "maximum": 3600 }
                },
                "required": ["command"]
            }),
            Some(RuntimeHint::Local),
        ),
        builtin(
            "process.status",
            "Check a previously started process by id.",
            json!({
                "type": "object",
                "properties": {
                    "process_id": { "type": "string" }
                },
                "required": ["process_id"]
            }),
            Some(RuntimeHint::Local),
        ),
        // ── Browser verbs ──────────────────────────────────────────
        builtin(
            "browser.navigate",
            "Navigate the active tab to a URL.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string" }
                },
                "required": ["url"]
            }),
            Some(RuntimeHint::Browser),
        ),
        builtin(
            "browser.snapshot",
            "Take a ref-numbered accessibility/DOM snapshot of the active tab.",
            json!({
                "type": "object",
                "properties": {
                    "source": { "type": "string", "enum": ["ax", "dom"] },
                    "max_nodes": { "type": "integer", "minimum": 1 }
                }
            }),
            Some(RuntimeHint::Browser),
        ),
        builtin(
            "browser.click",
            "Click an element addressed by snapshot uid, ref, or backend node id.",
            json!({
                "type": "object",
                "properties": element_target_properties(),
                "anyOf": element_target_any_of()
            }),
            Some(RuntimeHint::Browser),
        ),
        builtin(
            "browser.fill",
            "Fill a form element with text.",
            json!({
                "type": "object",
                "properties": {
                    "uid": { "type": "string" },
                    "ref": { "type": "string" },
                    "backendNodeId": { "type": "integer" },
                    "value": { "type": "string" }
                },
                "required": ["value"],
                "anyOf": element_target_any_of()
            }),
            Some(RuntimeHint::Browser),
        ),
        builtin(
            "browser.press",
            "Send a key press to the focused element or an addressed element.",
            json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string" },
                    "uid": { "type": "string" },
                    "ref": { "type": "string" },
                    "backendNodeId": { "type": "integer" }
                },
                "required": ["key"]
            }),
            Some(RuntimeHint::Browser),
        ),
        builtin(
            "browser.scroll",
            "Scroll the page or an addressed element into view.",
            json!({
                "type": "object",
                "properties": {
                    "uid": { "type": "string" },
                    "ref": { "type": "string" },
                    "backendNodeId": { "type": "integer" },
                    "delta_y": { "type": "integer" }
                }
            }),
            Some(RuntimeHint::Browser),
        ),
        builtin(
            "browser.wait",
            "Wait for a condition on the active tab (selector, text, or timeout).",
            json!({
                "type": "object",
                "properties": {
                    "selector": { "type": "string" },
                    "text": { "type": "string" },
                    "timeout_ms": { "type": "integer", "minimum": 1, "maximum": 120000 }
                }
            }),
            Some(RuntimeHint::Browser),
        ),
        builtin(
            "browser.verify",
            "Verify an expectation against the current page state.",
            json!({
                "type": "object",
                "properties": {
                    "expectation": { "type": "string" },
                    "selector": { "type": "string" }
                },
                "required": ["expectation"]
            }),
            Some(RuntimeHint::Browser),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_validates() {
        for contract in builtin_contracts() {
            contract.validate().unwrap();
            assert_eq!(contract.source, ContractSource::Builtin);
        }
    }

    #[test]
    fn element_targeting_verbs_offer_three_alternatives() {
        for name in ["browser.click", "browser.fill"] {
            let contract = builtin_contracts()
                .into_iter()
                .find(|c| c.canonical_name == name)
                .unwrap();
            let any_of = contract.parameters["anyOf"].as_array().unwrap();
            assert!(any_of.len() >= 3, "{name} needs >= 3 target variants");
        }
    }

    #[test]
    fn fs_and_process_tools_carry_runtime_hint() {
        for contract in builtin_contracts() {
            let name = &contract.canonical_name;
            if name.starts_with("fs.") || name.starts_with("process.") {
                assert!(contract.runtime.is_some(), "{name} needs a runtime hint");
            }
        }
    }
}
