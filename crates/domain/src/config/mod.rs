mod bridge;
mod compaction;
mod llm;
mod server;

pub use bridge::*;
pub use compaction::*;
pub use llm::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub title: TitleConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session titles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleConfig {
    /// Derive a title from the first user prompt on append.
    #[serde(default = "d_true")]
    pub auto: bool,
    #[serde(default = "d_title_max")]
    pub max_chars: usize,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            auto: true,
            max_chars: d_title_max(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace event ring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-session ring buffer capacity for `brain.step.stream`.
    #[serde(default = "d_ring")]
    pub ring_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: d_ring(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tab leases
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Time-to-live for a tab lease without heartbeats.
    #[serde(default = "d_lease_ttl")]
    pub ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: d_lease_ttl(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_title_max() -> usize {
    80
}
fn d_ring() -> usize {
    512
}
fn d_lease_ttl() -> u64 {
    30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if let Some(default) = &self.llm.default_profile {
            if !self.llm.profiles.iter().any(|p| &p.id == default) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "llm.default_profile".into(),
                    message: format!("references unknown profile `{default}`"),
                });
            }
        }

        for (role, chain) in &self.llm.profile_chains {
            for id in chain {
                if !self.llm.profiles.iter().any(|p| &p.id == id) {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: format!("llm.profile_chains.{role}"),
                        message: format!("references unknown profile `{id}`"),
                    });
                }
            }
        }

        if self.compaction.keep_tail == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "compaction.keep_tail".into(),
                message: "keep_tail=0 compacts the entire conversation".into(),
            });
        }

        issues
    }
}
