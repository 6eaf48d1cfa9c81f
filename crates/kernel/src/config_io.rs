//! Config file loading, saving, and hot-apply.

use std::path::Path;

use sk_domain::config::{Config, ConfigSeverity};
use sk_domain::error::{Error, Result};

use crate::state::AppState;

/// Load the TOML config; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config =
        toml::from_str(&raw).map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;

    for issue in config.validate() {
        match issue.severity {
            ConfigSeverity::Error => return Err(Error::Config(issue.to_string())),
            ConfigSeverity::Warning => tracing::warn!(issue = %issue, "config warning"),
        }
    }
    Ok(config)
}

/// The active config with secrets redacted, for `config.get` and
/// `brain.debug.config`.
pub fn redacted(config: &Config) -> serde_json::Value {
    let mut value = serde_json::to_value(config).unwrap_or_default();
    if let Some(profiles) = value
        .pointer_mut("/llm/profiles")
        .and_then(|p| p.as_array_mut())
    {
        for profile in profiles {
            if let Some(key) = profile.get_mut("llm_api_key") {
                if key.as_str().is_some_and(|k| !k.is_empty()) {
                    *key = serde_json::Value::String("***".into());
                }
            }
        }
    }
    value
}

/// Handle `config.save`: validate, persist, and hot-apply the parts
/// that do not need a restart (profiles, chains, compaction, titles).
pub fn save_config(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let incoming: Config = serde_json::from_value(payload)
        .map_err(|e| Error::Args(format!("invalid config payload: {e}")))?;

    let issues = incoming.validate();
    if let Some(error) = issues
        .iter()
        .find(|i| i.severity == ConfigSeverity::Error)
    {
        return Err(Error::Config(error.to_string()));
    }

    let serialized = toml::to_string_pretty(&incoming)
        .map_err(|e| Error::Config(format!("serializing config: {e}")))?;
    std::fs::write(&state.config_path, serialized).map_err(Error::Io)?;

    {
        let mut active = state.config.write();
        active.llm = incoming.llm.clone();
        active.compaction = incoming.compaction.clone();
        active.title = incoming.title.clone();
        active.bridge = incoming.bridge.clone();
    }
    tracing::info!(path = %state.config_path.display(), "config saved and applied");

    Ok(serde_json::json!({
        "saved": true,
        "warnings": issues.iter().map(ToString::to_string).collect::<Vec<_>>(),
    }))
}
