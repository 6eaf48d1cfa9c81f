//! Hook registration: insertion-ordered chains per hook name.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::hook::{HookHandler, HookName};

#[derive(Default)]
pub struct HookRegistry {
    chains: RwLock<HashMap<HookName, Vec<HookHandler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to its hook's chain. Registration order is
    /// invocation order.
    pub fn register(&self, handler: HookHandler) {
        self.chains
            .write()
            .entry(handler.hook)
            .or_default()
            .push(handler);
    }

    /// Remove one handler by its `(plugin_id, id)` tuple.
    /// Returns true when something was removed.
    pub fn remove(&self, hook: HookName, plugin_id: &str, id: &str) -> bool {
        let mut chains = self.chains.write();
        let Some(chain) = chains.get_mut(&hook) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|h| !(h.plugin_id == plugin_id && h.id == id));
        before != chain.len()
    }

    /// Remove every handler a plugin registered.
    pub fn remove_plugin(&self, plugin_id: &str) -> usize {
        let mut chains = self.chains.write();
        let mut removed = 0;
        for chain in chains.values_mut() {
            let before = chain.len();
            chain.retain(|h| h.plugin_id != plugin_id);
            removed += before - chain.len();
        }
        removed
    }

    /// The chain for a hook, in registration order.
    pub fn handlers(&self, hook: HookName) -> Vec<HookHandler> {
        self.chains
            .read()
            .get(&hook)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, hook: HookName) -> usize {
        self.chains.read().get(&hook).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookVerdict;
    use std::sync::Arc;

    fn handler(plugin: &str, id: &str) -> HookHandler {
        HookHandler::new(
            HookName::ToolBeforeCall,
            plugin,
            id,
            Arc::new(|_| Box::pin(async { HookVerdict::Continue })),
        )
    }

    #[test]
    fn registration_order_is_preserved() {
        let registry = HookRegistry::new();
        registry.register(handler("p1", "first"));
        registry.register(handler("p2", "second"));

        let chain = registry.handlers(HookName::ToolBeforeCall);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, "first");
        assert_eq!(chain[1].id, "second");
    }

    #[test]
    fn removal_is_scoped_by_plugin() {
        let registry = HookRegistry::new();
        // Two plugins share the same user-provided hook id.
        registry.register(handler("p1", "shared"));
        registry.register(handler("p2", "shared"));

        assert!(registry.remove(HookName::ToolBeforeCall, "p1", "shared"));
        let chain = registry.handlers(HookName::ToolBeforeCall);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].plugin_id, "p2");
    }

    #[test]
    fn remove_plugin_clears_all_chains() {
        let registry = HookRegistry::new();
        registry.register(handler("p1", "a"));
        let mut other = handler("p1", "b");
        other.hook = HookName::LlmBeforeRequest;
        registry.register(other);

        assert_eq!(registry.remove_plugin("p1"), 2);
        assert_eq!(registry.count(HookName::ToolBeforeCall), 0);
        assert_eq!(registry.count(HookName::LlmBeforeRequest), 0);
    }
}
