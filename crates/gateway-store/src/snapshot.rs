use std::collections::BTreeMap;
use std::sync::Arc;

use gateway_core::{HealthSnapshot, Instance, LoadMetric, Template};

/// An immutable point-in-time view of the store. Cheap to clone — the four
/// maps are each behind their own `Arc` so a commit that only touches
/// instances doesn't have to re-share the (possibly large) template map.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub templates: Arc<BTreeMap<String, Template>>,
    pub instances: Arc<BTreeMap<String, Instance>>,
    pub health: Arc<BTreeMap<String, HealthSnapshot>>,
    pub metrics: Arc<BTreeMap<String, LoadMetric>>,
    pub revision: u64,
}
