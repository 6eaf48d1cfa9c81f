//! LLM route resolution and profile-chain escalation.
//!
//! Resolution order: explicit profile → first profile of the requested
//! role's chain → the configured default profile. The resolved profile
//! must carry an API base and key, and its provider must be registered.

use sk_domain::config::{EscalationPolicy, LlmConfig, LlmProfile};

use crate::registry::ProviderRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub profile: Option<String>,
    pub role: Option<String>,
    /// Position in the role chain; advanced by escalation.
    pub chain_position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Explicit,
    Default,
    Escalation,
}

impl RouteSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteSource::Explicit => "explicit",
            RouteSource::Default => "default",
            RouteSource::Escalation => "escalation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub profile: LlmProfile,
    pub provider: String,
    pub model: String,
    pub source: RouteSource,
    pub role: Option<String>,
    /// The full escalation chain this route was resolved against.
    pub ordered_profiles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("profile_not_found: {0}")]
    ProfileNotFound(String),
    #[error("missing_llm_config: profile `{0}` lacks llm_api_base or llm_api_key")]
    MissingLlmConfig(String),
    #[error("provider_not_found: `{0}` is not registered")]
    ProviderNotFound(String),
}

impl RouteError {
    /// The stable reason tag (`profile_not_found`, `missing_llm_config`,
    /// `provider_not_found`).
    pub fn reason(&self) -> &'static str {
        match self {
            RouteError::ProfileNotFound(_) => "profile_not_found",
            RouteError::MissingLlmConfig(_) => "missing_llm_config",
            RouteError::ProviderNotFound(_) => "provider_not_found",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn find_profile<'c>(config: &'c LlmConfig, id: &str) -> Option<&'c LlmProfile> {
    config.profiles.iter().find(|p| p.id == id)
}

pub fn resolve_route(
    config: &LlmConfig,
    registry: &ProviderRegistry,
    req: &RouteRequest,
) -> Result<ResolvedRoute, RouteError> {
    let (profile_id, source, ordered) = if let Some(explicit) = &req.profile {
        (explicit.clone(), RouteSource::Explicit, vec![explicit.clone()])
    } else if let Some(role) = &req.role {
        let chain = config
            .profile_chains
            .get(role)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RouteError::ProfileNotFound(format!("no chain for role `{role}`")))?;
        let id = chain
            .get(req.chain_position)
            .ok_or_else(|| {
                RouteError::ProfileNotFound(format!(
                    "role `{role}` chain has no profile at position {}",
                    req.chain_position
                ))
            })?
            .clone();
        let source = if req.chain_position > 0 {
            RouteSource::Escalation
        } else {
            RouteSource::Default
        };
        (id, source, chain.clone())
    } else {
        let id = config
            .default_profile
            .clone()
            .ok_or_else(|| RouteError::ProfileNotFound("no default profile configured".into()))?;
        (id.clone(), RouteSource::Default, vec![id])
    };

    let profile = find_profile(config, &profile_id)
        .ok_or_else(|| RouteError::ProfileNotFound(profile_id.clone()))?
        .clone();

    if profile.llm_api_base.is_empty() || profile.llm_api_key.is_empty() {
        return Err(RouteError::MissingLlmConfig(profile.id.clone()));
    }

    if !registry.contains(&profile.provider) {
        return Err(RouteError::ProviderNotFound(profile.provider.clone()));
    }

    Ok(ResolvedRoute {
        provider: profile.provider.clone(),
        model: profile.llm_model.clone(),
        source,
        role: req.role.clone(),
        ordered_profiles: ordered,
        profile,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Escalation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationDecision {
    Escalate { to: String, reason: String },
    NoChange { reason: String },
    Blocked { reason: String },
}

/// Decide whether repeated failure on `current_profile` should advance
/// through `ordered_profiles`.
pub fn decide_profile_escalation(
    ordered_profiles: &[String],
    current_profile: &str,
    repeated_failure: bool,
    policy: EscalationPolicy,
) -> EscalationDecision {
    if !repeated_failure {
        return EscalationDecision::NoChange {
            reason: "no_repeated_failure".into(),
        };
    }
    if policy == EscalationPolicy::Disabled {
        return EscalationDecision::Blocked {
            reason: "policy_disabled".into(),
        };
    }
    let Some(position) = ordered_profiles.iter().position(|p| p == current_profile) else {
        return EscalationDecision::Blocked {
            reason: "not_in_chain".into(),
        };
    };
    match ordered_profiles.get(position + 1) {
        Some(next) => EscalationDecision::Escalate {
            to: next.clone(),
            reason: "repeated_failure".into(),
        },
        None => EscalationDecision::Blocked {
            reason: "no_higher_profile".into(),
        },
    }
}
