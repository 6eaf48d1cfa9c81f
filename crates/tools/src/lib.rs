//! Canonical tool contracts: names, JSON-schema parameters, and the
//! override/alias policy.
//!
//! The registry ships builtin contracts for filesystem, shell, and the
//! closed set of browser-automation verbs. Overrides replace a builtin
//! at resolution time without touching it; unregistering an override
//! restores the builtin definition byte-identical. Aliases resolve only
//! when an override contract opts in.

pub mod builtin;
pub mod contract;
pub mod registry;

pub use contract::{ContractSource, RuntimeHint, ToolContract};
pub use registry::ToolContractRegistry;
