//! Provider resolution and invocation.
//!
//! Capability lane: explicit `capability` (+ optional `mode` filter) →
//! ordered provider list → first accepting provider. Mode lane (legacy):
//! `mode` without a capability → mode-level provider, with a single
//! scripted→cdp fallback attempt when policy allows it.

use std::collections::HashMap;

use parking_lot::RwLock;

use sk_domain::error::Error;

use crate::provider::{CapabilityError, CapabilityInput, Mode, ProviderRecord};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct CapabilityRegistry {
    /// capability -> ordered provider records.
    providers: RwLock<HashMap<String, Vec<ProviderRecord>>>,
    /// mode -> ordered mode-level providers (legacy lane).
    mode_providers: RwLock<HashMap<Mode, Vec<ProviderRecord>>>,
    /// Displaced providers per `(capability, id)` slot, LIFO.
    displaced: RwLock<HashMap<(String, String), Vec<ProviderRecord>>>,
}

/// Result of a mode-lane invocation.
#[derive(Debug)]
pub struct ModeInvokeOutcome {
    pub data: serde_json::Value,
    pub mode_used: Mode,
    pub fallback_from: Option<Mode>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ───────────────────────────────────────────────

    pub fn add_provider(&self, record: ProviderRecord) {
        self.providers
            .write()
            .entry(record.capability.clone())
            .or_default()
            .push(record);
    }

    pub fn add_mode_provider(&self, record: ProviderRecord) {
        self.mode_providers
            .write()
            .entry(record.mode)
            .or_default()
            .push(record);
    }

    /// Remove a provider by id. Returns true when something was removed.
    pub fn remove_provider(&self, capability: &str, id: &str) -> bool {
        let mut providers = self.providers.write();
        let Some(list) = providers.get_mut(capability) else {
            return false;
        };
        let before = list.len();
        list.retain(|p| p.id != id);
        before != list.len()
    }

    pub fn remove_mode_provider(&self, mode: Mode, id: &str) -> bool {
        let mut providers = self.mode_providers.write();
        let Some(list) = providers.get_mut(&mode) else {
            return false;
        };
        let before = list.len();
        list.retain(|p| p.id != id);
        before != list.len()
    }

    /// Replace the provider at `(capability, id)`, stacking the
    /// displaced record so replace chains unwind in LIFO order.
    pub fn replace_provider(&self, record: ProviderRecord) -> Result<(), Error> {
        let slot = (record.capability.clone(), record.id.clone());
        let mut providers = self.providers.write();
        let list = providers
            .get_mut(&record.capability)
            .ok_or_else(|| Error::RuntimeNotReady(format!(
                "no providers for capability `{}`",
                record.capability
            )))?;
        let position = list.iter().position(|p| p.id == record.id).ok_or_else(|| {
            Error::RuntimeNotReady(format!(
                "capability `{}` has no provider `{}` to replace",
                record.capability, record.id
            ))
        })?;
        let previous = std::mem::replace(&mut list[position], record);
        self.displaced.write().entry(slot).or_default().push(previous);
        Ok(())
    }

    /// Undo the most recent replacement of `(capability, id)`.
    pub fn restore_provider(&self, capability: &str, id: &str) -> Result<(), Error> {
        let slot = (capability.to_owned(), id.to_owned());
        let previous = self
            .displaced
            .write()
            .get_mut(&slot)
            .and_then(Vec::pop)
            .ok_or_else(|| {
                Error::RuntimeNotReady(format!(
                    "capability `{capability}` provider `{id}` has nothing to restore"
                ))
            })?;
        let mut providers = self.providers.write();
        let list = providers.entry(capability.to_owned()).or_default();
        match list.iter().position(|p| p.id == id) {
            Some(position) => list[position] = previous,
            None => list.push(previous),
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn provider_count(&self, capability: &str) -> usize {
        self.providers.read().get(capability).map_or(0, Vec::len)
    }

    // ── Resolution ─────────────────────────────────────────────────

    /// Resolve a provider for `capability`.
    ///
    /// 1. With a `mode` filter, only providers in that lane compete.
    /// 2. Providers are tried in descending priority; the first whose
    ///    `can_handle` accepts wins (absent predicate accepts).
    /// 3. An exhausted mode filter falls back to the unfiltered set.
    pub fn resolve(
        &self,
        capability: &str,
        mode: Option<Mode>,
        input: &CapabilityInput,
    ) -> Result<ProviderRecord, CapabilityError> {
        let providers = self.providers.read();
        let Some(candidates) = providers.get(capability).filter(|l| !l.is_empty()) else {
            return Err(CapabilityError::new(Error::RuntimeNotReady(format!(
                "no capability provider found for `{capability}`"
            )))
            .with_capability(capability));
        };

        if let Some(mode) = mode {
            if let Some(record) = pick(candidates.iter().filter(|p| p.mode == mode), input) {
                return Ok(record.clone());
            }
            // Mode filter exhausted: retry against the unfiltered set.
        }

        if let Some(record) = pick(candidates.iter(), input) {
            return Ok(record.clone());
        }

        let mut err = CapabilityError::new(Error::RuntimeNotReady(format!(
            "no capability provider found for `{capability}`"
        )))
        .with_capability(capability);
        if let Some(mode) = mode {
            err = err.with_mode(mode);
        }
        Err(err)
    }

    /// Resolve and invoke through the capability lane.
    pub async fn invoke_capability(
        &self,
        capability: &str,
        mode: Option<Mode>,
        input: CapabilityInput,
    ) -> Result<(serde_json::Value, Mode), CapabilityError> {
        let record = self.resolve(capability, mode, &input)?;
        let data = (record.invoke)(input).await.map_err(|e| {
            CapabilityError::new(e)
                .with_mode(record.mode)
                .with_capability(capability)
        })?;
        Ok((data, record.mode))
    }

    // ── Mode lane (legacy) ─────────────────────────────────────────

    fn mode_record(
        &self,
        mode: Mode,
        input: &CapabilityInput,
    ) -> Option<ProviderRecord> {
        let providers = self.mode_providers.read();
        providers
            .get(&mode)
            .and_then(|list| pick(list.iter(), input))
            .cloned()
    }

    /// Invoke a mode-level provider. A failed `script` invocation is
    /// retried on the `cdp` lane exactly once when
    /// `allow_script_fallback` permits; the outcome records where the
    /// result actually came from.
    pub async fn invoke_mode(
        &self,
        mode: Mode,
        input: CapabilityInput,
        allow_script_fallback: bool,
    ) -> Result<ModeInvokeOutcome, CapabilityError> {
        let record = self.mode_record(mode, &input).ok_or_else(|| {
            CapabilityError::new(Error::RuntimeNotReady(format!(
                "no provider registered for mode `{mode}`"
            )))
            .with_mode(mode)
        })?;

        match (record.invoke)(input.clone()).await {
            Ok(data) => Ok(ModeInvokeOutcome {
                data,
                mode_used: mode,
                fallback_from: None,
            }),
            Err(script_err) if mode == Mode::Script && allow_script_fallback => {
                tracing::warn!(
                    action = %input.action,
                    error = %script_err,
                    "script provider failed; attempting cdp fallback"
                );
                let fallback = self.mode_record(Mode::Cdp, &input).ok_or_else(|| {
                    CapabilityError::new(Error::RuntimeNotReady(
                        "cdp adapter not configured".into(),
                    ))
                    .with_mode(Mode::Cdp)
                })?;
                let data = (fallback.invoke)(input).await.map_err(|e| {
                    CapabilityError::new(e).with_mode(Mode::Cdp)
                })?;
                Ok(ModeInvokeOutcome {
                    data,
                    mode_used: Mode::Cdp,
                    fallback_from: Some(Mode::Script),
                })
            }
            Err(err) => Err(CapabilityError::new(err).with_mode(mode)),
        }
    }
}

/// First provider, in descending priority, whose predicate accepts.
/// Ties keep registration order (stable sort).
fn pick<'r>(
    candidates: impl Iterator<Item = &'r ProviderRecord>,
    input: &CapabilityInput,
) -> Option<&'r ProviderRecord> {
    let mut sorted: Vec<&ProviderRecord> = candidates.collect();
    sorted.sort_by_key(|p| std::cmp::Reverse(p.priority));
    sorted.into_iter().find(|p| p.accepts(input))
}
