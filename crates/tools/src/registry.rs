//! Contract registry: builtins, overrides, and alias resolution.

use std::collections::HashMap;

use parking_lot::RwLock;

use sk_domain::error::{Error, Result};
use sk_domain::tool::ToolDefinition;

use crate::builtin::builtin_contracts;
use crate::contract::{ContractSource, ToolContract};

#[derive(Default)]
struct ContractSlot {
    builtin: Option<ToolContract>,
    overlay: Option<ToolContract>,
}

impl ContractSlot {
    fn active(&self) -> Option<&ToolContract> {
        self.overlay.as_ref().or(self.builtin.as_ref())
    }
}

pub struct ToolContractRegistry {
    slots: RwLock<HashMap<String, ContractSlot>>,
}

impl ToolContractRegistry {
    /// Registry seeded with the builtin contract set.
    pub fn new() -> Self {
        let mut slots: HashMap<String, ContractSlot> = HashMap::new();
        for contract in builtin_contracts() {
            slots.insert(
                contract.canonical_name.clone(),
                ContractSlot {
                    builtin: Some(contract),
                    overlay: None,
                },
            );
        }
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Register a contract. With `replace=false`, the canonical name
    /// must be new; with `replace=true`, the contract overlays the
    /// builtin (tagged `source=override`) without touching it.
    pub fn register(&self, mut contract: ToolContract, replace: bool) -> Result<()> {
        contract.validate()?;
        let mut slots = self.slots.write();
        let slot = slots.entry(contract.canonical_name.clone()).or_default();

        if slot.active().is_some() && !replace {
            return Err(Error::Args(format!(
                "tool `{}` already registered (pass replace to override)",
                contract.canonical_name
            )));
        }
        if slot.builtin.is_some() {
            contract.source = ContractSource::Override;
        }
        slot.overlay = Some(contract);
        Ok(())
    }

    /// Drop the override for a canonical name, restoring the builtin
    /// definition exactly as shipped. Unregistering a name with no
    /// builtin removes it entirely.
    pub fn unregister(&self, canonical_name: &str) -> Result<()> {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(canonical_name) else {
            return Err(Error::Args(format!("tool `{canonical_name}` not registered")));
        };
        if slot.overlay.take().is_none() {
            return Err(Error::Args(format!(
                "tool `{canonical_name}` has no override to remove"
            )));
        }
        if slot.builtin.is_none() {
            slots.remove(canonical_name);
        }
        Ok(())
    }

    /// Resolve a name to its active contract. Canonical names always
    /// resolve; aliases resolve only when the active contract is an
    /// override that lists them (legacy aliases are rejected by
    /// default).
    pub fn resolve(&self, name: &str) -> Option<ToolContract> {
        let slots = self.slots.read();
        if let Some(slot) = slots.get(name) {
            return slot.active().cloned();
        }
        slots.values().find_map(|slot| {
            let active = slot.active()?;
            (active.source != ContractSource::Builtin
                && active.aliases.iter().any(|a| a == name))
            .then(|| active.clone())
        })
    }

    pub fn get(&self, canonical_name: &str) -> Option<ToolContract> {
        self.slots
            .read()
            .get(canonical_name)
            .and_then(|s| s.active().cloned())
    }

    /// LLM-facing definitions for every active contract, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let slots = self.slots.read();
        let mut definitions: Vec<ToolDefinition> = slots
            .values()
            .filter_map(|s| s.active().map(ToolContract::definition))
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolContractRegistry {
    fn default() -> Self {
        Self::new()
    }
}
