use serde::{Deserialize, Serialize};

use sk_domain::error::{Error, Result};
use sk_domain::tool::ToolDefinition;

/// Where a contract definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractSource {
    Builtin,
    Override,
    Plugin,
}

/// Which side of the bridge executes the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeHint {
    Browser,
    Local,
}

/// A canonical tool contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContract {
    pub canonical_name: String,
    pub description: String,
    /// JSON Schema for the parameters; must be an `object` schema.
    pub parameters: serde_json::Value,
    /// Legacy names this contract answers to. Only honored on
    /// overrides — builtins never resolve through aliases.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub source: ContractSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeHint>,
}

impl ToolContract {
    /// Structural checks every contract must pass: a non-empty
    /// description and an `object` parameter schema.
    pub fn validate(&self) -> Result<()> {
        if self.canonical_name.is_empty() {
            return Err(Error::Args("tool contract needs a canonical name".into()));
        }
        if self.description.is_empty() {
            return Err(Error::Args(format!(
                "tool `{}` needs a non-empty description",
                self.canonical_name
            )));
        }
        let is_object_schema = self
            .parameters
            .get("type")
            .and_then(|t| t.as_str())
            .map_or(false, |t| t == "object");
        if !is_object_schema {
            return Err(Error::Args(format!(
                "tool `{}` parameters must be a JSON-schema object",
                self.canonical_name
            )));
        }
        Ok(())
    }

    /// Enforce the schema's `required` list against call arguments.
    pub fn check_required(&self, args: &serde_json::Value) -> Result<()> {
        let Some(required) = self.parameters.get("required").and_then(|r| r.as_array()) else {
            return Ok(());
        };
        let Some(args_map) = args.as_object() else {
            return Err(Error::Args(format!(
                "tool `{}` arguments must be an object",
                self.canonical_name
            )));
        };
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args_map.contains_key(field) {
                return Err(Error::Args(format!(
                    "tool `{}` missing required argument `{field}`",
                    self.canonical_name
                )));
            }
        }
        Ok(())
    }

    /// The LLM-facing definition for this contract.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.canonical_name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}
