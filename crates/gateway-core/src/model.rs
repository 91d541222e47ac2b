use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch. The gateway never persists runtime
/// state across restarts (§1 Non-goals), so a plain epoch-millis integer is
/// sufficient — no timezone-aware calendar type is needed anywhere in this
/// crate.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Which wire transport a template's instances speak.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Subprocess,
    Http,
    HttpStream,
}

/// Authentication descriptor attached to an http/http-stream template.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateAuth {
    None,
    Bearer { token: String },
    ApiKey { header: String, value: String },
}

/// Declarative recipe for reaching a backend (§3 "Template").
///
/// Created by the registry operator via `POST /api/templates`; mutated only
/// by explicit upsert; destroyed by explicit delete. Owned exclusively by
/// the Observation Store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub version: String,
    pub transport: TransportKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<TemplateAuth>,

    #[serde(default = "Template::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<String>,
}

impl Template {
    pub fn default_timeout_ms() -> u64 {
        30_000
    }

    /// Validates the invariants §3 states for a template: a non-empty name
    /// and transport-appropriate required fields.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("template name must not be empty".to_string());
        }
        match self.transport {
            TransportKind::Subprocess => {
                if self
                    .command
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or_default()
                    .is_empty()
                {
                    return Err("subprocess template requires a non-empty command".to_string());
                }
            }
            TransportKind::Http | TransportKind::HttpStream => {
                if self
                    .base_url
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or_default()
                    .is_empty()
                {
                    return Err("http(-stream) template requires a non-empty baseUrl".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Instance lifecycle states (§4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopped,
    Failed,
}

impl InstanceState {
    /// Transitions permitted by §4.3's table. Used by the store to reject
    /// illegal jumps (e.g. `idle` -> `degraded`).
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Idle, Starting) => true,
            (Starting, Running) | (Starting, Failed) => true,
            (Running, Degraded) | (Running, Failed) => true,
            (Degraded, Running) | (Degraded, Failed) => true,
            (_, Stopped) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Failed | InstanceState::Stopped)
    }
}

/// A live realization of a template (§3 "Instance").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub template: Template,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_at: Option<u64>,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, template: Template) -> Self {
        Self {
            id: id.into(),
            template,
            state: InstanceState::Idle,
            pid: None,
            started_at: now_millis(),
            last_health_at: None,
            error_count: 0,
            metadata: BTreeMap::new(),
        }
    }
}

/// Health snapshot for one instance (§3 "Health snapshot"). Replaced,
/// never merged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub observed_at: u64,
}

impl HealthSnapshot {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            observed_at: now_millis(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
            observed_at: now_millis(),
        }
    }

    pub fn is_fresh(&self, ttl_ms: u64) -> bool {
        now_millis().saturating_sub(self.observed_at) <= ttl_ms
    }
}

/// Load metric for one instance (§3 "Load metric"). Updated monotonically
/// per completed request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadMetric {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub added_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<u64>,
}

impl LoadMetric {
    pub fn new_at(added_at: u64) -> Self {
        Self {
            request_count: 0,
            error_count: 0,
            avg_latency_ms: 0.0,
            added_at,
            last_request_at: None,
        }
    }

    /// Folds one completed request into the running average, matching the
    /// distilled spec's "moving average of latency" note in §4.8 step 9.
    pub fn record(&mut self, latency_ms: u64, failed: bool) {
        let n = self.request_count as f64;
        self.avg_latency_ms = (self.avg_latency_ms * n + latency_ms as f64) / (n + 1.0);
        self.request_count += 1;
        if failed {
            self.error_count += 1;
        }
        self.last_request_at = Some(now_millis());
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subprocess_template() -> Template {
        Template {
            name: "svc-a".to_string(),
            version: "1.0.0".to_string(),
            transport: TransportKind::Subprocess,
            command: Some("echo".to_string()),
            args: vec![],
            env: BTreeMap::new(),
            base_url: None,
            auth: None,
            timeout_ms: Template::default_timeout_ms(),
            retries: 0,
            trust_level: None,
        }
    }

    #[test]
    fn template_requires_non_empty_name() {
        let mut t = subprocess_template();
        t.name = String::new();
        assert!(t.validate().is_err());
    }

    #[test]
    fn subprocess_template_requires_command() {
        let mut t = subprocess_template();
        t.command = None;
        assert!(t.validate().is_err());
        t.command = Some("  ".to_string());
        assert!(t.validate().is_err());
    }

    #[test]
    fn http_template_requires_base_url() {
        let mut t = subprocess_template();
        t.transport = TransportKind::Http;
        t.command = None;
        assert!(t.validate().is_err());
        t.base_url = Some("http://localhost:9000".to_string());
        assert!(t.validate().is_ok());
    }

    #[test]
    fn instance_state_transitions_follow_the_table() {
        assert!(InstanceState::Idle.can_transition_to(InstanceState::Starting));
        assert!(!InstanceState::Idle.can_transition_to(InstanceState::Degraded));
        assert!(InstanceState::Starting.can_transition_to(InstanceState::Running));
        assert!(InstanceState::Starting.can_transition_to(InstanceState::Failed));
        assert!(InstanceState::Running.can_transition_to(InstanceState::Degraded));
        assert!(InstanceState::Degraded.can_transition_to(InstanceState::Running));
        assert!(InstanceState::Running.can_transition_to(InstanceState::Stopped));
        assert!(!InstanceState::Stopped.can_transition_to(InstanceState::Running));
    }

    #[test]
    fn load_metric_tracks_monotonic_counts_and_average_latency() {
        let mut m = LoadMetric::new_at(0);
        m.record(100, false);
        m.record(200, true);
        assert_eq!(m.request_count, 2);
        assert_eq!(m.error_count, 1);
        assert!((m.avg_latency_ms - 150.0).abs() < f64::EPSILON);
        assert!((m.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn health_snapshot_freshness() {
        let snap = HealthSnapshot::ok(12);
        assert!(snap.is_fresh(60_000));
    }
}
