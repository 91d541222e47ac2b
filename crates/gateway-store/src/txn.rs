use std::collections::BTreeMap;

use gateway_core::{GatewayError, HealthSnapshot, Instance, InstanceState, LoadMetric, Template};

use crate::event::ChangeEvent;
use crate::snapshot::Snapshot;

/// A shallow, field-by-field patch applied to an existing instance
/// (`patchInstance`, §4.1). Fields left `None`/empty are untouched; `metadata`
/// is merged key-by-key rather than replaced wholesale.
#[derive(Clone, Debug, Default)]
pub struct InstancePatch {
    pub state: Option<InstanceState>,
    pub pid: Option<Option<u32>>,
    pub last_health_at: Option<Option<u64>>,
    pub error_count_delta: Option<u64>,
    pub metadata: BTreeMap<String, String>,
}

impl InstancePatch {
    fn apply(self, instance: &mut Instance) -> Result<(), GatewayError> {
        if let Some(state) = self.state {
            if !instance.state.can_transition_to(state) {
                return Err(GatewayError::Internal(format!(
                    "illegal instance transition {:?} -> {:?}",
                    instance.state, state
                )));
            }
            instance.state = state;
        }
        if let Some(pid) = self.pid {
            instance.pid = pid;
        }
        if let Some(last_health_at) = self.last_health_at {
            instance.last_health_at = last_health_at;
        }
        if let Some(delta) = self.error_count_delta {
            instance.error_count += delta;
        }
        instance.metadata.extend(self.metadata);
        Ok(())
    }
}

/// The mutable working copy a transaction closure writes into. Cloned from
/// the committed [`Snapshot`] when the transaction opens; discarded without
/// a trace if the closure returns `Err`.
pub struct Txn {
    pub(crate) templates: BTreeMap<String, Template>,
    pub(crate) instances: BTreeMap<String, Instance>,
    pub(crate) health: BTreeMap<String, HealthSnapshot>,
    pub(crate) metrics: BTreeMap<String, LoadMetric>,
    pub(crate) events: Vec<ChangeEvent>,
}

impl Txn {
    pub(crate) fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            templates: (*snapshot.templates).clone(),
            instances: (*snapshot.instances).clone(),
            health: (*snapshot.health).clone(),
            metrics: (*snapshot.metrics).clone(),
            events: Vec::new(),
        }
    }

    pub fn get_template(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn get_instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn set_template(&mut self, template: Template) -> Result<(), GatewayError> {
        template.validate().map_err(GatewayError::Internal)?;
        self.events
            .push(ChangeEvent::TemplateSet(template.clone()));
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Rejects removal while any non-terminal instance still references the
    /// template (§3 "template removal precondition").
    pub fn remove_template(&mut self, name: &str) -> Result<(), GatewayError> {
        let referenced = self
            .instances
            .values()
            .any(|instance| instance.template.name == name && !instance.state.is_terminal());
        if referenced {
            return Err(GatewayError::Internal(format!(
                "template `{name}` has live instances referencing it"
            )));
        }
        if self.templates.remove(name).is_some() {
            self.events.push(ChangeEvent::TemplateRemove(name.to_string()));
        }
        Ok(())
    }

    pub fn set_instance(&mut self, instance: Instance) -> Result<(), GatewayError> {
        self.events.push(ChangeEvent::InstanceSet(instance.clone()));
        self.instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    pub fn patch_instance(&mut self, id: &str, patch: InstancePatch) -> Result<(), GatewayError> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound {
                what: format!("instance `{id}`"),
            })?;
        patch.apply(instance)?;
        let updated = instance.clone();
        self.events.push(ChangeEvent::InstanceSet(updated));
        Ok(())
    }

    /// Removing an instance cascades to its health and metrics entries in
    /// the same transaction, preserving the invariant that those maps never
    /// reference an absent instance id (§3).
    pub fn remove_instance(&mut self, id: &str) -> Result<(), GatewayError> {
        if self.instances.remove(id).is_some() {
            self.events.push(ChangeEvent::InstanceRemove(id.to_string()));
            if self.health.remove(id).is_some() {
                self.events.push(ChangeEvent::HealthRemove(id.to_string()));
            }
            if self.metrics.remove(id).is_some() {
                self.events.push(ChangeEvent::MetricsRemove(id.to_string()));
            }
        }
        Ok(())
    }

    pub fn set_health(&mut self, id: &str, snapshot: HealthSnapshot) -> Result<(), GatewayError> {
        if !self.instances.contains_key(id) {
            return Err(GatewayError::NotFound {
                what: format!("instance `{id}`"),
            });
        }
        self.events
            .push(ChangeEvent::HealthUpdate(id.to_string(), snapshot.clone()));
        self.health.insert(id.to_string(), snapshot);
        Ok(())
    }

    pub fn remove_health(&mut self, id: &str) -> Result<(), GatewayError> {
        if self.health.remove(id).is_some() {
            self.events.push(ChangeEvent::HealthRemove(id.to_string()));
        }
        Ok(())
    }

    pub fn set_metrics(&mut self, id: &str, metric: LoadMetric) -> Result<(), GatewayError> {
        if !self.instances.contains_key(id) {
            return Err(GatewayError::NotFound {
                what: format!("instance `{id}`"),
            });
        }
        self.events
            .push(ChangeEvent::MetricsUpdate(id.to_string(), metric.clone()));
        self.metrics.insert(id.to_string(), metric);
        Ok(())
    }

    /// Records a backend process exiting on its own (§4.2/§4.3
    /// "lifecycle:exit"): patches the instance to `Failed` unless it has
    /// already settled into a terminal state through some other path (e.g.
    /// an explicit `stop` that raced the exit), then always emits the exit
    /// event so the crash is visible on the log stream.
    pub fn record_exit(&mut self, id: &str, exit_code: Option<i32>) -> Result<(), GatewayError> {
        let instance = self.instances.get(id).ok_or_else(|| GatewayError::NotFound {
            what: format!("instance `{id}`"),
        })?;
        if !instance.state.is_terminal() {
            self.patch_instance(
                id,
                InstancePatch {
                    state: Some(InstanceState::Failed),
                    ..Default::default()
                },
            )?;
        }
        self.events
            .push(ChangeEvent::InstanceExit(id.to_string(), exit_code));
        Ok(())
    }

    /// Folds one completed request's latency/outcome into an instance's
    /// running metric, creating it at zero if this is the instance's first
    /// recorded request.
    pub fn record_request(
        &mut self,
        id: &str,
        latency_ms: u64,
        failed: bool,
    ) -> Result<(), GatewayError> {
        let mut metric = self
            .metrics
            .get(id)
            .cloned()
            .unwrap_or_else(|| LoadMetric::new_at(gateway_core::now_millis()));
        metric.record(latency_ms, failed);
        self.set_metrics(id, metric)
    }

    /// Nested transactions share the same buffer: calling this from inside
    /// an outer `atomic_update` closure simply runs `f` against the same
    /// working copy, so nested calls fold into the single outer commit and
    /// revision bump rather than being separate commits.
    pub fn atomic_update<F>(&mut self, f: F) -> Result<(), GatewayError>
    where
        F: FnOnce(&mut Txn) -> Result<(), GatewayError>,
    {
        f(self)
    }
}
