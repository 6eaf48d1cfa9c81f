//! CDP facade: lease- and binding-checked gateway to an injected
//! transport implementing the concrete command surface.

use std::sync::Arc;

use sk_domain::error::{Error, Result};

use crate::lease::{LeaseDenied, LeaseManager};
use crate::snapshot::{Snapshot, SnapshotBinder, SnapshotSource};

/// The concrete CDP command surface, supplied by the embedder.
#[async_trait::async_trait]
pub trait CdpTransport: Send + Sync {
    /// Lightweight page observation (url, title, readiness).
    async fn observe(&self, tab_id: &str) -> Result<serde_json::Value>;
    /// Produce a ref-numbered snapshot of the tab.
    async fn snapshot(&self, tab_id: &str, source: SnapshotSource) -> Result<Snapshot>;
    /// Execute one action verb against the tab.
    async fn action(
        &self,
        tab_id: &str,
        action: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value>;
    /// Check an expectation against current page state.
    async fn verify(&self, tab_id: &str, expectation: &str) -> Result<serde_json::Value>;
}

pub struct CdpFacade {
    transport: Arc<dyn CdpTransport>,
    leases: Arc<LeaseManager>,
    binder: Arc<SnapshotBinder>,
}

impl CdpFacade {
    pub fn new(
        transport: Arc<dyn CdpTransport>,
        leases: Arc<LeaseManager>,
        binder: Arc<SnapshotBinder>,
    ) -> Self {
        Self {
            transport,
            leases,
            binder,
        }
    }

    fn lease_checked(&self, tab_id: &str, owner: &str) -> Result<()> {
        self.leases.acquire(tab_id, owner).map(|_| ()).map_err(|e| match e {
            LeaseDenied::LockedByOther { holder } => {
                Error::Busy(format!("locked_by_other: tab `{tab_id}` held by `{holder}`"))
            }
            LeaseDenied::NotHeld => Error::Busy(format!("lease on `{tab_id}` not held")),
        })
    }

    pub async fn observe(&self, tab_id: &str, owner: &str) -> Result<serde_json::Value> {
        self.lease_checked(tab_id, owner)?;
        self.transport.observe(tab_id).await
    }

    /// Snapshot the tab and advance its binding generation.
    pub async fn snapshot(
        &self,
        tab_id: &str,
        owner: &str,
        source: SnapshotSource,
    ) -> Result<Snapshot> {
        self.lease_checked(tab_id, owner)?;
        let mut snapshot = self.transport.snapshot(tab_id, source).await?;
        snapshot.generation = self.binder.record_snapshot(tab_id);
        Ok(snapshot)
    }

    /// Execute an action bound to a snapshot generation.
    pub async fn action(
        &self,
        tab_id: &str,
        owner: &str,
        generation: u64,
        action: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.lease_checked(tab_id, owner)?;
        self.binder.check_binding(tab_id, generation)?;
        self.transport.action(tab_id, action, args).await
    }

    pub async fn verify(
        &self,
        tab_id: &str,
        owner: &str,
        expectation: &str,
    ) -> Result<serde_json::Value> {
        self.lease_checked(tab_id, owner)?;
        self.transport.verify(tab_id, expectation).await
    }

    pub fn switch_target(&self, tab_id: &str) {
        self.binder.switch_target(tab_id);
    }

    pub fn release(&self, tab_id: &str, owner: &str) -> bool {
        self.leases.release(tab_id, owner)
    }
}
