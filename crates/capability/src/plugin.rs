//! Plugin lifecycle with reversible effects.
//!
//! Every side effect a plugin causes (hook additions, provider
//! additions or replacements, policy overrides, LLM provider
//! replacements) is recorded in a per-plugin journal as an inverse
//! closure. Disabling the plugin replays the journal in reverse, which
//! unwinds replace chains across plugins in LIFO order without any
//! diffing or rescanning.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use sk_domain::error::{Error, Result};
use sk_hooks::{HookHandler, HookName, HookRegistry};
use sk_providers::{LlmProvider, ProviderRegistry};

use crate::policy::{CapabilityPolicy, PolicyStore};
use crate::provider::{Mode, ProviderRecord};
use crate::registry::CapabilityRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manifest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a plugin is allowed to touch. Registrations outside the
/// declared sets fail immediately and leave no partial effects behind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginPermissions {
    #[serde(default)]
    pub hooks: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub modes: Vec<String>,
    #[serde(default)]
    pub llm_providers: Vec<String>,
    #[serde(default)]
    pub replace_providers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub permissions: PluginPermissions,
}

/// Metadata surfaced by `brain.debug.plugins`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    pub manifest: PluginManifest,
    pub enabled: bool,
    pub registrations: usize,
    pub last_error: Option<String>,
}

/// An in-process plugin: a manifest plus a setup routine that performs
/// its registrations through the permission-checked context.
///
/// `setup` runs twice — a validating dry-run at registration and the
/// applying run at enable — so it must be repeatable and must route
/// every side effect through the context.
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> PluginManifest;
    fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
}

type Inverse = Box<dyn FnOnce() + Send>;

/// Whether a context applies effects or only checks them.
///
/// `register` dry-runs `setup` in [`ContextMode::Validate`]: every
/// registration is checked against the declared permission set and an
/// undeclared one fails the registration right there, with nothing
/// applied. `enable` re-runs `setup` in [`ContextMode::Apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextMode {
    Validate,
    Apply,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handed to a plugin's `setup`. Each method checks the manifest's
/// permissions; in apply mode it then performs the effect and journals
/// its inverse, in validate mode it stops after the check.
pub struct PluginContext<'h> {
    host: &'h PluginHost,
    plugin_id: String,
    permissions: PluginPermissions,
    journal: Vec<Inverse>,
    mode: ContextMode,
}

impl PluginContext<'_> {
    fn denied(&self, what: impl std::fmt::Display) -> Error {
        Error::Args(format!(
            "plugin `{}` permission violation: {what} not declared in manifest",
            self.plugin_id
        ))
    }

    pub fn add_hook(&mut self, hook: HookName, id: &str, handler: sk_hooks::hook::HookFn) -> Result<()> {
        if !self.permissions.hooks.iter().any(|h| h == hook.as_str()) {
            return Err(self.denied(format_args!("hook `{hook}`")));
        }
        if self.mode == ContextMode::Validate {
            return Ok(());
        }
        self.host
            .hooks
            .register(HookHandler::new(hook, self.plugin_id.clone(), id, handler));

        let hooks = Arc::clone(&self.host.hooks);
        let plugin_id = self.plugin_id.clone();
        let hook_id = id.to_owned();
        self.journal.push(Box::new(move || {
            hooks.remove(hook, &plugin_id, &hook_id);
        }));
        Ok(())
    }

    pub fn add_capability_provider(&mut self, mut record: ProviderRecord) -> Result<()> {
        if !self
            .permissions
            .capabilities
            .iter()
            .any(|c| c == &record.capability)
        {
            return Err(self.denied(format_args!("capability `{}`", record.capability)));
        }
        if self.mode == ContextMode::Validate {
            return Ok(());
        }
        record.plugin_id = Some(self.plugin_id.clone());
        let capability = record.capability.clone();
        let id = record.id.clone();
        self.host.capabilities.add_provider(record);

        let capabilities = Arc::clone(&self.host.capabilities);
        self.journal.push(Box::new(move || {
            capabilities.remove_provider(&capability, &id);
        }));
        Ok(())
    }

    pub fn replace_capability_provider(&mut self, mut record: ProviderRecord) -> Result<()> {
        if !self.permissions.replace_providers {
            return Err(self.denied("replace_providers"));
        }
        if !self
            .permissions
            .capabilities
            .iter()
            .any(|c| c == &record.capability)
        {
            return Err(self.denied(format_args!("capability `{}`", record.capability)));
        }
        if self.mode == ContextMode::Validate {
            return Ok(());
        }
        record.plugin_id = Some(self.plugin_id.clone());
        let capability = record.capability.clone();
        let id = record.id.clone();
        self.host.capabilities.replace_provider(record)?;

        let capabilities = Arc::clone(&self.host.capabilities);
        self.journal.push(Box::new(move || {
            if let Err(e) = capabilities.restore_provider(&capability, &id) {
                tracing::warn!(error = %e, "restore of replaced provider failed");
            }
        }));
        Ok(())
    }

    pub fn add_mode_provider(&mut self, mut record: ProviderRecord) -> Result<()> {
        if !self
            .permissions
            .modes
            .iter()
            .any(|m| m == record.mode.as_str())
        {
            return Err(self.denied(format_args!("mode `{}`", record.mode)));
        }
        if self.mode == ContextMode::Validate {
            return Ok(());
        }
        record.plugin_id = Some(self.plugin_id.clone());
        let mode = record.mode;
        let id = record.id.clone();
        self.host.capabilities.add_mode_provider(record);

        let capabilities = Arc::clone(&self.host.capabilities);
        self.journal.push(Box::new(move || {
            capabilities.remove_mode_provider(mode, &id);
        }));
        Ok(())
    }

    pub fn push_policy(&mut self, capability: &str, policy: CapabilityPolicy) -> Result<()> {
        if !self.permissions.capabilities.iter().any(|c| c == capability) {
            return Err(self.denied(format_args!("capability `{capability}` (policy)")));
        }
        if self.mode == ContextMode::Validate {
            return Ok(());
        }
        self.host.policies.push_override(capability, policy);

        let policies = Arc::clone(&self.host.policies);
        let capability = capability.to_owned();
        self.journal.push(Box::new(move || {
            policies.pop_override(&capability);
        }));
        Ok(())
    }

    pub fn replace_llm_provider(
        &mut self,
        id: &str,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<()> {
        if !self.permissions.replace_providers {
            return Err(self.denied("replace_providers"));
        }
        if !self.permissions.llm_providers.iter().any(|p| p == id) {
            return Err(self.denied(format_args!("llm provider `{id}`")));
        }
        if self.mode == ContextMode::Validate {
            return Ok(());
        }
        self.host
            .llm
            .replace(id, provider)
            .map_err(Error::RuntimeNotReady)?;

        let llm = Arc::clone(&self.host.llm);
        let id = id.to_owned();
        self.journal.push(Box::new(move || {
            if let Err(e) = llm.restore(&id) {
                tracing::warn!(error = %e, "restore of replaced llm provider failed");
            }
        }));
        Ok(())
    }

    pub fn add_llm_provider(&mut self, id: &str, provider: Arc<dyn LlmProvider>) -> Result<()> {
        if !self.permissions.llm_providers.iter().any(|p| p == id) {
            return Err(self.denied(format_args!("llm provider `{id}`")));
        }
        if self.mode == ContextMode::Validate {
            return Ok(());
        }
        self.host
            .llm
            .register(id, provider)
            .map_err(Error::RuntimeNotReady)?;

        let llm = Arc::clone(&self.host.llm);
        let id = id.to_owned();
        self.journal.push(Box::new(move || {
            llm.unregister(&id);
        }));
        Ok(())
    }

    pub fn registration_count(&self) -> usize {
        self.journal.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Host
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PluginSlot {
    plugin: Arc<dyn Plugin>,
    record: PluginRecord,
    journal: Mutex<Vec<Inverse>>,
}

pub struct PluginHost {
    hooks: Arc<HookRegistry>,
    capabilities: Arc<CapabilityRegistry>,
    policies: Arc<PolicyStore>,
    llm: Arc<ProviderRegistry>,
    plugins: RwLock<HashMap<String, PluginSlot>>,
    /// Registration order, for stable debug listings.
    order: RwLock<Vec<String>>,
}

impl PluginHost {
    pub fn new(
        hooks: Arc<HookRegistry>,
        capabilities: Arc<CapabilityRegistry>,
        policies: Arc<PolicyStore>,
        llm: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            hooks,
            capabilities,
            policies,
            llm,
            plugins: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Register a plugin (disabled). The manifest is validated up
    /// front — unknown hook names and modes in the permission lists are
    /// rejected — and `setup` is dry-run against the declared
    /// permission set: any registration outside it fails right here,
    /// with no effects applied, not at enable time.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<PluginRecord> {
        let manifest = plugin.manifest();
        if manifest.id.is_empty() {
            return Err(Error::Args("plugin manifest id must not be empty".into()));
        }
        for hook in &manifest.permissions.hooks {
            if HookName::parse(hook).is_none() {
                return Err(Error::Args(format!(
                    "plugin `{}` declares unknown hook `{hook}`",
                    manifest.id
                )));
            }
        }
        for mode in &manifest.permissions.modes {
            if Mode::parse(mode).is_none() {
                return Err(Error::Args(format!(
                    "plugin `{}` declares unknown mode `{mode}`",
                    manifest.id
                )));
            }
        }

        // Dry-run: every registration checked, nothing applied.
        let mut ctx = PluginContext {
            host: self,
            plugin_id: manifest.id.clone(),
            permissions: manifest.permissions.clone(),
            journal: Vec::new(),
            mode: ContextMode::Validate,
        };
        plugin.setup(&mut ctx)?;

        let mut plugins = self.plugins.write();
        if plugins.contains_key(&manifest.id) {
            return Err(Error::Args(format!(
                "plugin `{}` already registered",
                manifest.id
            )));
        }
        let record = PluginRecord {
            manifest: manifest.clone(),
            enabled: false,
            registrations: 0,
            last_error: None,
        };
        plugins.insert(
            manifest.id.clone(),
            PluginSlot {
                plugin,
                record: record.clone(),
                journal: Mutex::new(Vec::new()),
            },
        );
        self.order.write().push(manifest.id);
        Ok(record)
    }

    /// Enable a plugin: run its setup through the permission-checked
    /// context. Permissions were enforced at registration; a failure
    /// here (a precondition such as a missing replace target) unwinds
    /// every effect applied so far and leaves the plugin disabled with
    /// `last_error` set.
    pub fn enable(&self, plugin_id: &str) -> Result<PluginRecord> {
        let (plugin, permissions) = {
            let plugins = self.plugins.read();
            let slot = plugins
                .get(plugin_id)
                .ok_or_else(|| Error::Args(format!("plugin `{plugin_id}` not registered")))?;
            if slot.record.enabled {
                return Ok(slot.record.clone());
            }
            (Arc::clone(&slot.plugin), slot.record.manifest.permissions.clone())
        };

        let mut ctx = PluginContext {
            host: self,
            plugin_id: plugin_id.to_owned(),
            permissions,
            journal: Vec::new(),
            mode: ContextMode::Apply,
        };

        match plugin.setup(&mut ctx) {
            Ok(()) => {
                let registrations = ctx.journal.len();
                let mut plugins = self.plugins.write();
                let slot = plugins
                    .get_mut(plugin_id)
                    .ok_or_else(|| Error::Args(format!("plugin `{plugin_id}` not registered")))?;
                *slot.journal.lock() = ctx.journal;
                slot.record.enabled = true;
                slot.record.registrations = registrations;
                slot.record.last_error = None;
                Ok(slot.record.clone())
            }
            Err(e) => {
                // No partial effects survive a failed setup.
                for inverse in ctx.journal.drain(..).rev() {
                    inverse();
                }
                let mut plugins = self.plugins.write();
                if let Some(slot) = plugins.get_mut(plugin_id) {
                    slot.record.last_error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Disable a plugin: replay its journal in reverse.
    pub fn disable(&self, plugin_id: &str) -> Result<PluginRecord> {
        let (journal, record) = {
            let mut plugins = self.plugins.write();
            let slot = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| Error::Args(format!("plugin `{plugin_id}` not registered")))?;
            if !slot.record.enabled {
                return Ok(slot.record.clone());
            }
            slot.record.enabled = false;
            slot.record.registrations = 0;
            let journal = std::mem::take(&mut *slot.journal.lock());
            let record = slot.record.clone();
            (journal, record)
        };

        for inverse in journal.into_iter().rev() {
            inverse();
        }

        Ok(record)
    }

    /// Disable (if needed) and forget a plugin.
    pub fn unregister(&self, plugin_id: &str) -> Result<()> {
        self.disable(plugin_id)?;
        self.plugins.write().remove(plugin_id);
        self.order.write().retain(|id| id != plugin_id);
        Ok(())
    }

    pub fn records(&self) -> Vec<PluginRecord> {
        let plugins = self.plugins.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| plugins.get(id).map(|s| s.record.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CapabilityInput;

    struct TestPlugin {
        manifest: PluginManifest,
        value: &'static str,
    }

    impl TestPlugin {
        fn new(id: &str, value: &'static str, replace: bool) -> Arc<Self> {
            Arc::new(Self {
                manifest: PluginManifest {
                    id: id.into(),
                    name: id.into(),
                    version: "0.1.0".into(),
                    permissions: PluginPermissions {
                        hooks: vec!["tool.before_call".into()],
                        capabilities: vec!["fs.read".into()],
                        modes: vec!["custom".into()],
                        llm_providers: vec![],
                        replace_providers: replace,
                    },
                },
                value,
            })
        }
    }

    impl Plugin for TestPlugin {
        fn manifest(&self) -> PluginManifest {
            self.manifest.clone()
        }

        fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
            let value = self.value;
            ctx.replace_capability_provider(ProviderRecord {
                capability: "fs.read".into(),
                id: "reader".into(),
                mode: Mode::Custom,
                priority: 0,
                can_handle: None,
                invoke: Arc::new(move |_| {
                    Box::pin(async move { Ok(serde_json::json!(value)) })
                }),
                plugin_id: None,
            })
        }
    }

    fn host_with_base() -> (PluginHost, Arc<CapabilityRegistry>) {
        let capabilities = Arc::new(CapabilityRegistry::new());
        capabilities.add_provider(ProviderRecord {
            capability: "fs.read".into(),
            id: "reader".into(),
            mode: Mode::Bridge,
            priority: 0,
            can_handle: None,
            invoke: Arc::new(|_| Box::pin(async { Ok(serde_json::json!("base")) })),
            plugin_id: None,
        });
        let host = PluginHost::new(
            Arc::new(HookRegistry::new()),
            Arc::clone(&capabilities),
            Arc::new(PolicyStore::new()),
            Arc::new(ProviderRegistry::new()),
        );
        (host, capabilities)
    }

    async fn read_value(capabilities: &CapabilityRegistry) -> serde_json::Value {
        capabilities
            .invoke_capability(
                "fs.read",
                None,
                CapabilityInput {
                    session_id: "s".into(),
                    action: "read".into(),
                    args: serde_json::json!({}),
                    invoke_id: None,
                },
            )
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn replace_chain_across_plugins_unwinds_lifo() {
        let (host, capabilities) = host_with_base();

        host.register(TestPlugin::new("a", "from-a", true)).unwrap();
        host.register(TestPlugin::new("b", "from-b", true)).unwrap();
        host.register(TestPlugin::new("c", "from-c", true)).unwrap();
        host.enable("a").unwrap();
        host.enable("b").unwrap();
        host.enable("c").unwrap();
        assert_eq!(read_value(&capabilities).await, "from-c");

        host.disable("c").unwrap();
        assert_eq!(read_value(&capabilities).await, "from-b");
        host.disable("b").unwrap();
        assert_eq!(read_value(&capabilities).await, "from-a");
        host.disable("a").unwrap();
        assert_eq!(read_value(&capabilities).await, "base");
    }

    #[tokio::test]
    async fn undeclared_registration_rejected_at_register_time() {
        struct Rogue;
        impl Plugin for Rogue {
            fn manifest(&self) -> PluginManifest {
                PluginManifest {
                    id: "rogue".into(),
                    name: "rogue".into(),
                    version: "0.1.0".into(),
                    permissions: PluginPermissions {
                        hooks: vec!["tool.before_call".into()],
                        // "fs.write" deliberately missing.
                        capabilities: vec!["fs.read".into()],
                        modes: vec![],
                        llm_providers: vec![],
                        replace_providers: false,
                    },
                }
            }

            fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
                ctx.add_capability_provider(ProviderRecord {
                    capability: "fs.read".into(),
                    id: "extra".into(),
                    mode: Mode::Custom,
                    priority: 5,
                    can_handle: None,
                    invoke: Arc::new(|_| Box::pin(async { Ok(serde_json::json!("extra")) })),
                    plugin_id: None,
                })?;
                // Second registration violates the manifest.
                ctx.add_capability_provider(ProviderRecord {
                    capability: "fs.write".into(),
                    id: "w".into(),
                    mode: Mode::Custom,
                    priority: 0,
                    can_handle: None,
                    invoke: Arc::new(|_| Box::pin(async { Ok(serde_json::json!(null)) })),
                    plugin_id: None,
                })
            }
        }

        let (host, capabilities) = host_with_base();

        // The mismatch surfaces at register, not later at enable.
        let err = host.register(Arc::new(Rogue)).unwrap_err();
        assert!(err.to_string().contains("permission violation"));

        // Nothing was stored and nothing was applied — the dry-run
        // never touched the registries.
        assert!(host.records().is_empty());
        assert_eq!(capabilities.provider_count("fs.read"), 1);
        assert!(host.enable("rogue").is_err());
    }

    #[tokio::test]
    async fn enable_failure_unwinds_partial_effects() {
        // Permissions are all declared, so registration passes; the
        // replace target is missing, so enable fails mid-setup.
        struct HalfBroken;
        impl Plugin for HalfBroken {
            fn manifest(&self) -> PluginManifest {
                PluginManifest {
                    id: "half-broken".into(),
                    name: "half-broken".into(),
                    version: "0.1.0".into(),
                    permissions: PluginPermissions {
                        hooks: vec![],
                        capabilities: vec!["fs.read".into()],
                        modes: vec![],
                        llm_providers: vec![],
                        replace_providers: true,
                    },
                }
            }

            fn setup(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
                ctx.add_capability_provider(ProviderRecord {
                    capability: "fs.read".into(),
                    id: "extra".into(),
                    mode: Mode::Custom,
                    priority: 5,
                    can_handle: None,
                    invoke: Arc::new(|_| Box::pin(async { Ok(serde_json::json!("extra")) })),
                    plugin_id: None,
                })?;
                // Declared but unsatisfiable: no provider `ghost` exists.
                ctx.replace_capability_provider(ProviderRecord {
                    capability: "fs.read".into(),
                    id: "ghost".into(),
                    mode: Mode::Custom,
                    priority: 0,
                    can_handle: None,
                    invoke: Arc::new(|_| Box::pin(async { Ok(serde_json::json!(null)) })),
                    plugin_id: None,
                })
            }
        }

        let (host, capabilities) = host_with_base();
        host.register(Arc::new(HalfBroken)).unwrap();
        assert!(host.enable("half-broken").is_err());

        // The first (permitted) registration was rolled back too.
        assert_eq!(capabilities.provider_count("fs.read"), 1);
        let record = &host.records()[0];
        assert!(!record.enabled);
        assert!(record.last_error.is_some());
    }

    #[test]
    fn unknown_hook_in_manifest_rejected_at_register() {
        struct BadManifest;
        impl Plugin for BadManifest {
            fn manifest(&self) -> PluginManifest {
                PluginManifest {
                    id: "bad".into(),
                    name: "bad".into(),
                    version: "0.1.0".into(),
                    permissions: PluginPermissions {
                        hooks: vec!["tool.sideways".into()],
                        ..Default::default()
                    },
                }
            }
            fn setup(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
                Ok(())
            }
        }

        let (host, _) = host_with_base();
        assert!(host.register(Arc::new(BadManifest)).is_err());
    }
}
