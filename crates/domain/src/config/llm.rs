use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM routing config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Registered routing profiles. Contractually an **array**: an
    /// object-shaped value fails to deserialize, and route resolution
    /// against anything but a list yields `profile_not_found`.
    #[serde(default)]
    pub profiles: Vec<LlmProfile>,
    /// Profile used when a request names neither a profile nor a role.
    #[serde(default)]
    pub default_profile: Option<String>,
    /// Escalation order per role: role -> ordered profile ids.
    #[serde(default)]
    pub profile_chains: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub escalation_policy: EscalationPolicy,
}

/// A named LLM routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProfile {
    pub id: String,
    /// Registered provider id (e.g. "openai_compat").
    pub provider: String,
    #[serde(default)]
    pub llm_api_base: String,
    #[serde(default)]
    pub llm_api_key: String,
    pub llm_model: String,
    /// The role this profile serves by default (e.g. "worker").
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "d_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "d_retry_max")]
    pub retry_max_attempts: u32,
    #[serde(default = "d_retry_cap")]
    pub retry_cap_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    /// Advance to the next profile in the role chain on repeated failure.
    #[default]
    UpgradeOnly,
    /// Never advance through the chain.
    Disabled,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_request_timeout() -> u64 {
    60_000
}
fn d_retry_max() -> u32 {
    3
}
fn d_retry_cap() -> u64 {
    15_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_deserialize_from_array() {
        let config: LlmConfig = toml::from_str(
            r#"
            default_profile = "worker.basic"
            escalation_policy = "upgrade_only"

            [[profiles]]
            id = "worker.basic"
            provider = "openai_compat"
            llm_api_base = "http://localhost:8000/v1"
            llm_api_key = "sk-test"
            llm_model = "small"
            role = "worker"

            [profile_chains]
            worker = ["worker.basic", "worker.pro"]
            "#,
        )
        .unwrap();
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].retry_max_attempts, 3);
        assert_eq!(config.profile_chains["worker"].len(), 2);
    }

    #[test]
    fn object_shaped_profiles_rejected() {
        // A map where the array is expected must not deserialize.
        let parsed: Result<LlmConfig, _> = toml::from_str(
            r#"
            [profiles]
            "worker.basic" = { provider = "openai_compat", llm_model = "small" }
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn escalation_policy_default_is_upgrade_only() {
        let config = LlmConfig::default();
        assert_eq!(config.escalation_policy, EscalationPolicy::UpgradeOnly);
    }
}
