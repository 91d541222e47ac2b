#![forbid(unsafe_code)]
//! The Observation Store: the gateway's single in-memory source of truth for
//! templates, instances, health snapshots and load metrics (§3, §4.1).
//!
//! All writes go through [`ObservationStore::atomic_update`], which buffers
//! mutations against a private clone of the current maps and only publishes
//! them — as one new immutable snapshot plus an ordered burst of change
//! events — if the caller's closure returns `Ok`. Readers always see either
//! the state before a commit or the state fully after it, never a partial
//! write.

mod event;
mod snapshot;
mod store;
mod txn;

pub use event::ChangeEvent;
pub use snapshot::Snapshot;
pub use store::ObservationStore;
pub use txn::{InstancePatch, Txn};
