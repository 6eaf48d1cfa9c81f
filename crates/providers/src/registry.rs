//! Provider registry with reversible replacement.
//!
//! Plugins may replace a registered LLM provider; the displaced one is
//! pushed onto a per-id stack so disabling plugins unwinds arbitrary
//! replace chains in LIFO order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::traits::LlmProvider;

#[derive(Default)]
struct Slot {
    current: Option<Arc<dyn LlmProvider>>,
    displaced: Vec<Arc<dyn LlmProvider>>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under an id. Registering over an existing id
    /// without `replace` is an error surfaced to the caller.
    pub fn register(&self, id: &str, provider: Arc<dyn LlmProvider>) -> Result<(), String> {
        let mut slots = self.slots.write();
        let slot = slots.entry(id.to_owned()).or_default();
        if slot.current.is_some() {
            return Err(format!("llm provider `{id}` already registered"));
        }
        slot.current = Some(provider);
        Ok(())
    }

    /// Replace the provider under `id`, stashing the displaced one.
    /// Returns an error when there is nothing to replace.
    pub fn replace(&self, id: &str, provider: Arc<dyn LlmProvider>) -> Result<(), String> {
        let mut slots = self.slots.write();
        let slot = slots.entry(id.to_owned()).or_default();
        match slot.current.take() {
            Some(previous) => {
                slot.displaced.push(previous);
                slot.current = Some(provider);
                Ok(())
            }
            None => Err(format!("llm provider `{id}` not registered; nothing to replace")),
        }
    }

    /// Undo the most recent [`replace`](Self::replace) for `id`.
    pub fn restore(&self, id: &str) -> Result<(), String> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| format!("llm provider `{id}` not registered"))?;
        match slot.displaced.pop() {
            Some(previous) => {
                slot.current = Some(previous);
                Ok(())
            }
            None => Err(format!("llm provider `{id}` has no displaced provider to restore")),
        }
    }

    /// Remove a provider registered (not replaced) under `id`.
    pub fn unregister(&self, id: &str) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(id) {
            slot.current = None;
            if slot.displaced.is_empty() {
                slots.remove(id);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.slots.read().get(id).and_then(|s| s.current.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        let slots = self.slots.read();
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, s)| s.current.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChatError, ChatRequest, ChatResponse};

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl LlmProvider for Named {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ChatError> {
            Ok(ChatResponse {
                content: self.0.into(),
                tool_calls: vec![],
                usage: None,
                model: self.0.into(),
                finish_reason: None,
            })
        }
        fn provider_id(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn register_and_get() {
        let registry = ProviderRegistry::new();
        registry.register("a", Arc::new(Named("a"))).unwrap();
        assert!(registry.contains("a"));
        assert!(registry.register("a", Arc::new(Named("a2"))).is_err());
    }

    #[test]
    fn replace_chain_unwinds_lifo() {
        let registry = ProviderRegistry::new();
        registry.register("p", Arc::new(Named("base"))).unwrap();
        registry.replace("p", Arc::new(Named("b"))).unwrap();
        registry.replace("p", Arc::new(Named("c"))).unwrap();

        assert_eq!(registry.get("p").unwrap().provider_id(), "c");
        registry.restore("p").unwrap();
        assert_eq!(registry.get("p").unwrap().provider_id(), "b");
        registry.restore("p").unwrap();
        assert_eq!(registry.get("p").unwrap().provider_id(), "base");
        assert!(registry.restore("p").is_err());
    }

    #[test]
    fn replace_without_base_fails() {
        let registry = ProviderRegistry::new();
        assert!(registry.replace("ghost", Arc::new(Named("x"))).is_err());
    }
}
