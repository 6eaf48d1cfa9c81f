//! Per-capability policies with stackable overrides.
//!
//! Builtin defaults sit at the bottom; overrides (config- or
//! plugin-supplied) stack on top and unwind in LIFO order, the same
//! mechanism provider replacement uses.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPolicy {
    #[default]
    Off,
    OnCritical,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeasePolicy {
    #[default]
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    pub default_verify_policy: VerifyPolicy,
    pub lease_policy: LeasePolicy,
    pub allow_script_fallback: bool,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            default_verify_policy: VerifyPolicy::Off,
            lease_policy: LeasePolicy::None,
            allow_script_fallback: true,
        }
    }
}

pub struct PolicyStore {
    builtin: HashMap<String, CapabilityPolicy>,
    overrides: RwLock<HashMap<String, Vec<CapabilityPolicy>>>,
}

impl PolicyStore {
    /// Store seeded with the builtin defaults.
    pub fn new() -> Self {
        let mut builtin = HashMap::new();
        builtin.insert(
            "browser.action".to_owned(),
            CapabilityPolicy {
                default_verify_policy: VerifyPolicy::OnCritical,
                lease_policy: LeasePolicy::Auto,
                allow_script_fallback: true,
            },
        );
        builtin.insert(
            "browser.verify".to_owned(),
            CapabilityPolicy {
                default_verify_policy: VerifyPolicy::Always,
                lease_policy: LeasePolicy::Auto,
                allow_script_fallback: false,
            },
        );
        Self {
            builtin,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// The effective policy: topmost override, else builtin, else default.
    pub fn effective(&self, capability: &str) -> CapabilityPolicy {
        if let Some(top) = self
            .overrides
            .read()
            .get(capability)
            .and_then(|stack| stack.last())
        {
            return *top;
        }
        self.builtin
            .get(capability)
            .copied()
            .unwrap_or_default()
    }

    /// Push an override for a capability.
    pub fn push_override(&self, capability: &str, policy: CapabilityPolicy) {
        self.overrides
            .write()
            .entry(capability.to_owned())
            .or_default()
            .push(policy);
    }

    /// Pop the topmost override. Returns false when none was present.
    pub fn pop_override(&self, capability: &str) -> bool {
        let mut overrides = self.overrides.write();
        let Some(stack) = overrides.get_mut(capability) else {
            return false;
        };
        let popped = stack.pop().is_some();
        if stack.is_empty() {
            overrides.remove(capability);
        }
        popped
    }

    pub fn override_depth(&self, capability: &str) -> usize {
        self.overrides.read().get(capability).map_or(0, Vec::len)
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_browser_action_defaults() {
        let store = PolicyStore::new();
        let policy = store.effective("browser.action");
        assert_eq!(policy.default_verify_policy, VerifyPolicy::OnCritical);
        assert_eq!(policy.lease_policy, LeasePolicy::Auto);
        assert!(policy.allow_script_fallback);
    }

    #[test]
    fn unknown_capability_gets_default() {
        let store = PolicyStore::new();
        let policy = store.effective("fs.read");
        assert_eq!(policy.default_verify_policy, VerifyPolicy::Off);
        assert_eq!(policy.lease_policy, LeasePolicy::None);
    }

    #[test]
    fn overrides_stack_and_unwind() {
        let store = PolicyStore::new();
        let strict = CapabilityPolicy {
            default_verify_policy: VerifyPolicy::Always,
            lease_policy: LeasePolicy::Required,
            allow_script_fallback: false,
        };
        let relaxed = CapabilityPolicy::default();

        store.push_override("browser.action", strict);
        store.push_override("browser.action", relaxed);
        assert_eq!(store.effective("browser.action"), relaxed);

        assert!(store.pop_override("browser.action"));
        assert_eq!(store.effective("browser.action"), strict);

        assert!(store.pop_override("browser.action"));
        // Back to the builtin.
        assert_eq!(
            store.effective("browser.action").default_verify_policy,
            VerifyPolicy::OnCritical
        );
        assert!(!store.pop_override("browser.action"));
    }
}
