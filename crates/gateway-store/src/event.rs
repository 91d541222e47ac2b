use gateway_core::{HealthSnapshot, Instance, LoadMetric, Template};

/// One typed mutation emitted by a committed transaction (§4.1 "emits a
/// typed change event"). Subscribers observe these in the exact order they
/// were produced inside the transaction.
#[derive(Clone, Debug)]
pub enum ChangeEvent {
    TemplateSet(Template),
    TemplateRemove(String),
    InstanceSet(Instance),
    InstanceRemove(String),
    HealthUpdate(String, HealthSnapshot),
    HealthRemove(String),
    MetricsUpdate(String, LoadMetric),
    MetricsRemove(String),
    /// A backend process exited on its own, not through `stop` (§4.2/§4.3
    /// "lifecycle:exit"). Carries the process exit code when the OS
    /// reported one.
    InstanceExit(String, Option<i32>),
}

impl ChangeEvent {
    /// A short tag for logging and for the HTTP log stream, independent of
    /// the (potentially large) payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::TemplateSet(_) => "template:set",
            ChangeEvent::TemplateRemove(_) => "template:remove",
            ChangeEvent::InstanceSet(_) => "instance:set",
            ChangeEvent::InstanceRemove(_) => "instance:remove",
            ChangeEvent::HealthUpdate(..) => "health:update",
            ChangeEvent::HealthRemove(_) => "health:remove",
            ChangeEvent::MetricsUpdate(..) => "metrics:update",
            ChangeEvent::MetricsRemove(_) => "metrics:remove",
            ChangeEvent::InstanceExit(..) => "lifecycle:exit",
        }
    }
}
