//! Per-tab leases: time-bounded exclusive right to drive a tab.
//!
//! `acquire → heartbeat → release`. A lease held by owner A denies any
//! other owner with `locked_by_other` until A releases it or the TTL
//! expires without a heartbeat.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub tab_id: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Why an acquire or heartbeat was denied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseDenied {
    #[error("locked_by_other: tab held by `{holder}`")]
    LockedByOther { holder: String },
    #[error("lease not held")]
    NotHeld,
}

pub struct LeaseManager {
    ttl: Duration,
    leases: Mutex<HashMap<String, Lease>>,
}

impl LeaseManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn fresh_expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.ttl.as_millis() as i64)
    }

    /// Acquire (or renew) the lease on a tab. Re-acquiring by the
    /// current holder extends the TTL; anyone else is denied until the
    /// lease is released or expires.
    pub fn acquire(&self, tab_id: &str, owner: &str) -> Result<Lease, LeaseDenied> {
        let mut leases = self.leases.lock();
        let now = Utc::now();

        if let Some(existing) = leases.get(tab_id) {
            if existing.expires_at > now && existing.owner != owner {
                return Err(LeaseDenied::LockedByOther {
                    holder: existing.owner.clone(),
                });
            }
        }

        let lease = match leases.get(tab_id) {
            Some(existing) if existing.owner == owner && existing.expires_at > now => Lease {
                expires_at: self.fresh_expiry(),
                ..existing.clone()
            },
            _ => Lease {
                lease_id: uuid::Uuid::new_v4().to_string(),
                tab_id: tab_id.to_owned(),
                owner: owner.to_owned(),
                expires_at: self.fresh_expiry(),
            },
        };
        leases.insert(tab_id.to_owned(), lease.clone());
        Ok(lease)
    }

    /// Extend a held lease. Only the current holder may heartbeat.
    pub fn heartbeat(&self, tab_id: &str, owner: &str) -> Result<Lease, LeaseDenied> {
        let mut leases = self.leases.lock();
        let now = Utc::now();
        match leases.get_mut(tab_id) {
            Some(lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at = self.fresh_expiry();
                Ok(lease.clone())
            }
            Some(lease) if lease.expires_at > now => Err(LeaseDenied::LockedByOther {
                holder: lease.owner.clone(),
            }),
            _ => Err(LeaseDenied::NotHeld),
        }
    }

    /// Release a lease. Returns true when the caller held it.
    pub fn release(&self, tab_id: &str, owner: &str) -> bool {
        let mut leases = self.leases.lock();
        match leases.get(tab_id) {
            Some(lease) if lease.owner == owner => {
                leases.remove(tab_id);
                true
            }
            _ => false,
        }
    }

    /// Current holder of a tab, if the lease is still live.
    pub fn holder(&self, tab_id: &str) -> Option<String> {
        let leases = self.leases.lock();
        leases
            .get(tab_id)
            .filter(|l| l.expires_at > Utc::now())
            .map(|l| l.owner.clone())
    }
}
