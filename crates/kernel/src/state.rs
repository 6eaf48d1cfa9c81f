use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use sk_browser::{LeaseManager, SnapshotBinder};
use sk_bridge::BridgeLane;
use sk_capability::{CapabilityRegistry, PluginHost, PolicyStore};
use sk_domain::config::Config;
use sk_domain::error::Result;
use sk_hooks::HookRegistry;
use sk_providers::{OpenAiCompatProvider, ProviderRegistry};
use sk_sessions::SessionStore;
use sk_tools::ToolContractRegistry;
use sk_vfs::VirtualFs;

use crate::runtime::events::EventHub;
use crate::runtime::run_state::RunStateMap;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Config & persistence** — config, session store, virtual fs
/// - **LLM** — provider registry (plugin-replaceable adapter kinds)
/// - **Extension runtime** — hooks, capabilities, policies, plugins
/// - **Tools & browser** — contract registry, bridge lane, leases,
///   snapshot binder
/// - **Kernel** — run states, event hub
#[derive(Clone)]
pub struct AppState {
    // ── Config & persistence ──────────────────────────────────────
    pub config: Arc<RwLock<Config>>,
    pub config_path: PathBuf,
    pub sessions: Arc<SessionStore>,
    pub vfs: Arc<VirtualFs>,

    // ── LLM ───────────────────────────────────────────────────────
    pub llm: Arc<ProviderRegistry>,

    // ── Extension runtime ─────────────────────────────────────────
    pub hooks: Arc<HookRegistry>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub policies: Arc<PolicyStore>,
    pub plugins: Arc<PluginHost>,

    // ── Tools & browser ───────────────────────────────────────────
    pub contracts: Arc<ToolContractRegistry>,
    pub bridge: Arc<BridgeLane>,
    pub leases: Arc<LeaseManager>,
    pub binder: Arc<SnapshotBinder>,

    // ── Kernel ────────────────────────────────────────────────────
    pub runs: Arc<RunStateMap>,
    pub events: Arc<EventHub>,
}

impl AppState {
    /// Build the full state from a loaded config. Registers the
    /// builtin `openai_compat` adapter kind; plugins may replace it.
    pub fn build(config: Config, config_path: PathBuf) -> Result<Self> {
        let state_path = config.server.state_path.clone();
        let sessions = Arc::new(SessionStore::open(&state_path, config.title.clone())?);
        let vfs = Arc::new(VirtualFs::open(&state_path)?);

        let llm = Arc::new(ProviderRegistry::new());
        if let Err(e) = llm.register(
            "openai_compat",
            Arc::new(OpenAiCompatProvider::new("openai_compat")),
        ) {
            tracing::warn!(error = %e, "builtin llm adapter registration failed");
        }

        let hooks = Arc::new(HookRegistry::new());
        let capabilities = Arc::new(CapabilityRegistry::new());
        let policies = Arc::new(PolicyStore::new());
        let plugins = Arc::new(PluginHost::new(
            Arc::clone(&hooks),
            Arc::clone(&capabilities),
            Arc::clone(&policies),
            Arc::clone(&llm),
        ));

        let bridge_token = std::env::var(&config.bridge.token_env).ok();
        let bridge = Arc::new(BridgeLane::from_config(&config.bridge, bridge_token));

        let leases = Arc::new(LeaseManager::new(std::time::Duration::from_secs(
            config.lease.ttl_secs,
        )));
        let events = Arc::new(EventHub::new(config.events.ring_capacity));

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            sessions,
            vfs,
            llm,
            hooks,
            capabilities,
            policies,
            plugins,
            contracts: Arc::new(ToolContractRegistry::new()),
            bridge,
            leases,
            binder: Arc::new(SnapshotBinder::new()),
            runs: Arc::new(RunStateMap::new()),
            events,
        })
    }
}
