//! Chain execution with fail-open semantics.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;

use crate::hook::{HookName, HookVerdict};
use crate::registry::HookRegistry;

/// The outcome of running a hook chain over an event envelope.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    /// The envelope with every accepted patch shallow-merged in.
    pub envelope: serde_json::Value,
    /// Set when a handler blocked the operation.
    pub blocked: Option<String>,
}

impl ChainOutcome {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// Run the chain for `hook` over `envelope`, in registration order.
///
/// Patches are shallow-merged and chained: each handler sees the
/// previous handler's patch applied. A block short-circuits. A handler
/// that panics or outlives its timeout is treated as `continue` — the
/// chain never fails because an extension misbehaved.
pub async fn run_chain(
    registry: &HookRegistry,
    hook: HookName,
    envelope: serde_json::Value,
) -> ChainOutcome {
    let mut envelope = envelope;

    for handler in registry.handlers(hook) {
        let fut = (handler.handler)(envelope.clone());
        let timed = tokio::time::timeout(
            Duration::from_millis(handler.timeout_ms),
            AssertUnwindSafe(fut).catch_unwind(),
        )
        .await;

        let verdict = match timed {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_panic)) => {
                tracing::warn!(
                    hook = %hook,
                    plugin_id = %handler.plugin_id,
                    handler_id = %handler.id,
                    "hook handler panicked; continuing (fail-open)"
                );
                HookVerdict::Continue
            }
            Err(_elapsed) => {
                tracing::warn!(
                    hook = %hook,
                    plugin_id = %handler.plugin_id,
                    handler_id = %handler.id,
                    timeout_ms = handler.timeout_ms,
                    "hook handler timed out; continuing (fail-open)"
                );
                HookVerdict::Continue
            }
        };

        match verdict {
            HookVerdict::Continue => {}
            HookVerdict::Patch { patch } => shallow_merge(&mut envelope, &patch),
            HookVerdict::Block { reason } => {
                return ChainOutcome {
                    envelope,
                    blocked: Some(reason),
                };
            }
        }
    }

    ChainOutcome {
        envelope,
        blocked: None,
    }
}

/// Top-level key replacement; nested objects are overwritten wholesale.
fn shallow_merge(envelope: &mut serde_json::Value, patch: &serde_json::Value) {
    let Some(patch_map) = patch.as_object() else {
        return;
    };
    if !envelope.is_object() {
        *envelope = serde_json::Value::Object(Default::default());
    }
    if let Some(target) = envelope.as_object_mut() {
        for (key, value) in patch_map {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookHandler;
    use std::sync::Arc;

    fn registry_with(handlers: Vec<HookHandler>) -> HookRegistry {
        let registry = HookRegistry::new();
        for handler in handlers {
            registry.register(handler);
        }
        registry
    }

    fn patching(plugin: &str, id: &str, patch: serde_json::Value) -> HookHandler {
        HookHandler::new(
            HookName::LlmBeforeRequest,
            plugin,
            id,
            Arc::new(move |_| {
                let patch = patch.clone();
                Box::pin(async move { HookVerdict::Patch { patch } })
            }),
        )
    }

    #[tokio::test]
    async fn patches_chain_in_order() {
        let registry = registry_with(vec![
            patching("p", "a", serde_json::json!({"model": "first", "temperature": 0.7})),
            // Second handler sees the first patch applied and overrides one key.
            HookHandler::new(
                HookName::LlmBeforeRequest,
                "p",
                "b",
                Arc::new(|envelope| {
                    Box::pin(async move {
                        assert_eq!(envelope["model"], "first");
                        HookVerdict::Patch {
                            patch: serde_json::json!({"model": "second"}),
                        }
                    })
                }),
            ),
        ]);

        let outcome = run_chain(
            &registry,
            HookName::LlmBeforeRequest,
            serde_json::json!({"model": "base"}),
        )
        .await;

        assert!(!outcome.is_blocked());
        assert_eq!(outcome.envelope["model"], "second");
        assert_eq!(outcome.envelope["temperature"], 0.7);
    }

    #[tokio::test]
    async fn block_short_circuits() {
        let registry = registry_with(vec![
            HookHandler::new(
                HookName::LlmBeforeRequest,
                "p",
                "blocker",
                Arc::new(|_| {
                    Box::pin(async {
                        HookVerdict::Block {
                            reason: "policy".into(),
                        }
                    })
                }),
            ),
            patching("p", "never", serde_json::json!({"model": "unreached"})),
        ]);

        let outcome = run_chain(&registry, HookName::LlmBeforeRequest, serde_json::json!({})).await;
        assert_eq!(outcome.blocked.as_deref(), Some("policy"));
        assert!(outcome.envelope.get("model").is_none());
    }

    #[tokio::test]
    async fn panicking_handler_is_fail_open() {
        let registry = registry_with(vec![
            HookHandler::new(
                HookName::LlmBeforeRequest,
                "p",
                "boom",
                Arc::new(|_| Box::pin(async { panic!("handler bug") })),
            ),
            patching("p", "after", serde_json::json!({"survived": true})),
        ]);

        let outcome = run_chain(&registry, HookName::LlmBeforeRequest, serde_json::json!({})).await;
        assert!(!outcome.is_blocked());
        assert_eq!(outcome.envelope["survived"], true);
    }

    #[tokio::test]
    async fn timed_out_handler_is_fail_open() {
        let slow = HookHandler::new(
            HookName::LlmBeforeRequest,
            "p",
            "slow",
            Arc::new(|_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    HookVerdict::Block {
                        reason: "too late".into(),
                    }
                })
            }),
        )
        .with_timeout_ms(20);

        let registry = registry_with(vec![slow, patching("p", "after", serde_json::json!({"ok": 1}))]);
        let outcome = run_chain(&registry, HookName::LlmBeforeRequest, serde_json::json!({})).await;
        assert!(!outcome.is_blocked());
        assert_eq!(outcome.envelope["ok"], 1);
    }

    #[tokio::test]
    async fn block_honored_after_faulting_handlers() {
        let registry = registry_with(vec![
            HookHandler::new(
                HookName::LlmBeforeRequest,
                "p",
                "boom",
                Arc::new(|_| Box::pin(async { panic!("bug") })),
            ),
            HookHandler::new(
                HookName::LlmBeforeRequest,
                "p",
                "blocker",
                Arc::new(|_| {
                    Box::pin(async {
                        HookVerdict::Block {
                            reason: "still blocks".into(),
                        }
                    })
                }),
            ),
        ]);

        let outcome = run_chain(&registry, HookName::LlmBeforeRequest, serde_json::json!({})).await;
        assert_eq!(outcome.blocked.as_deref(), Some("still blocks"));
    }
}
