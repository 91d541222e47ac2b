use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use gateway_core::{GatewayError, HealthSnapshot, Instance, LoadMetric, Template};
use tokio::sync::mpsc;
use tracing::trace;

use crate::event::ChangeEvent;
use crate::snapshot::Snapshot;
use crate::txn::{InstancePatch, Txn};

/// The single-writer, many-reader Observation Store (§4.1).
///
/// Reads go through a lock-free [`ArcSwap`] snapshot load. Writes serialize
/// on `writer` — a plain (non-async) mutex, which is what makes an
/// `atomic_update` closure's signature (`FnOnce(&mut Txn) -> Result<...>`,
/// no `async`) a guarantee rather than a convention: there is no executor
/// reachable from inside the lock, so a caller cannot accidentally hold it
/// across an await point.
pub struct ObservationStore {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
}

impl Default for ObservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationStore {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            writer: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn revision(&self) -> u64 {
        self.snapshot().revision
    }

    /// Registers a new subscriber. The returned receiver observes every
    /// change event emitted by commits from this point forward, in commit
    /// order; it never sees events from before it subscribed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Runs `f` against a private working copy of the current maps. If `f`
    /// returns `Ok`, the working copy is published as the new snapshot (one
    /// revision bump) and its buffered events are delivered to subscribers,
    /// in order, after the writer lock has been released. If `f` returns
    /// `Err`, nothing is published and no events fire.
    pub fn atomic_update<F>(&self, f: F) -> Result<u64, GatewayError>
    where
        F: FnOnce(&mut Txn) -> Result<(), GatewayError>,
    {
        let events = {
            let _guard = self.writer.lock().unwrap();
            let base = self.snapshot.load_full();
            let mut txn = Txn::from_snapshot(&base);
            f(&mut txn)?;

            let next = Arc::new(Snapshot {
                templates: Arc::new(txn.templates),
                instances: Arc::new(txn.instances),
                health: Arc::new(txn.health),
                metrics: Arc::new(txn.metrics),
                revision: base.revision + 1,
            });
            self.snapshot.store(next);
            txn.events
        };

        self.emit(events);
        Ok(self.revision())
    }

    fn emit(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        for event in events {
            trace!(kind = event.kind(), "store change event");
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    // -- read-only convenience accessors -----------------------------------

    pub fn get_template(&self, name: &str) -> Option<Template> {
        self.snapshot().templates.get(name).cloned()
    }

    pub fn list_templates(&self) -> Vec<Template> {
        self.snapshot().templates.values().cloned().collect()
    }

    pub fn get_instance(&self, id: &str) -> Option<Instance> {
        self.snapshot().instances.get(id).cloned()
    }

    pub fn list_instances(&self) -> Vec<Instance> {
        self.snapshot().instances.values().cloned().collect()
    }

    pub fn list_instances_for_template(&self, template: &str) -> Vec<Instance> {
        self.snapshot()
            .instances
            .values()
            .filter(|i| i.template.name == template)
            .cloned()
            .collect()
    }

    pub fn get_health(&self, id: &str) -> Option<HealthSnapshot> {
        self.snapshot().health.get(id).cloned()
    }

    pub fn get_metrics(&self, id: &str) -> Option<LoadMetric> {
        self.snapshot().metrics.get(id).cloned()
    }

    // -- single-operation write wrappers ------------------------------------
    // Each is implemented in terms of `atomic_update` so every write, single
    // or composite, goes through the same commit-and-emit path.

    pub fn set_template(&self, template: Template) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.set_template(template))
    }

    pub fn remove_template(&self, name: &str) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.remove_template(name))
    }

    pub fn set_instance(&self, instance: Instance) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.set_instance(instance))
    }

    pub fn patch_instance(&self, id: &str, patch: InstancePatch) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.patch_instance(id, patch))
    }

    pub fn remove_instance(&self, id: &str) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.remove_instance(id))
    }

    pub fn set_health(&self, id: &str, snapshot: HealthSnapshot) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.set_health(id, snapshot))
    }

    pub fn set_metrics(&self, id: &str, metric: LoadMetric) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.set_metrics(id, metric))
    }

    pub fn record_request(
        &self,
        id: &str,
        latency_ms: u64,
        failed: bool,
    ) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.record_request(id, latency_ms, failed))
    }

    pub fn mark_instance_exited(&self, id: &str, exit_code: Option<i32>) -> Result<u64, GatewayError> {
        self.atomic_update(|txn| txn.record_exit(id, exit_code))
    }
}
