//! Browser-side shared resources: per-tab leases, snapshot generation
//! binding, and the facade over an injected CDP transport.
//!
//! The concrete CDP command surface is an external collaborator; this
//! crate owns the invariants around it — no two sessions drive the
//! same tab, and no action runs against a stale snapshot.

pub mod facade;
pub mod lease;
pub mod snapshot;

pub use facade::{CdpFacade, CdpTransport};
pub use lease::{Lease, LeaseDenied, LeaseManager};
pub use snapshot::{Snapshot, SnapshotBinder, SnapshotNode, SnapshotSource};
