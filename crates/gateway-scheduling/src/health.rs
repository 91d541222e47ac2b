use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use gateway_core::{FrameIdGenerator, GatewayError, HealthSnapshot, Instance, InstanceState, Template};
use gateway_store::{InstancePatch, ObservationStore};
use gateway_transport::TransportAdapter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// Resolves a live, connected adapter for an instance. Implemented by the
/// Adapter Pool in `gateway-dispatch`; kept as a trait here so the Health
/// Prober does not have to depend on the dispatch crate (which itself
/// depends on this one for the Load Balancer and Backpressure Controller).
#[async_trait]
pub trait AdapterProvider: Send + Sync {
    async fn get(
        &self,
        instance_id: &str,
        template: &Template,
    ) -> Result<Arc<dyn TransportAdapter>, GatewayError>;
}

#[derive(Clone, Copy, Debug)]
pub struct HealthProberConfig {
    /// How long a health snapshot stays valid before a new probe is issued.
    pub ttl: Duration,
    /// Maximum number of probes in flight at once. `0` means unbounded.
    pub fanout: usize,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before a `running` instance is patched to
    /// `degraded` (§4.3 "consecutive failed probes ≥ N"). Not fixed by the
    /// source; treated as tunable, per the spec's open question on
    /// thresholds.
    pub degraded_after: u32,
}

impl Default for HealthProberConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            fanout: 8,
            probe_timeout: Duration::from_secs(3),
            degraded_after: 3,
        }
    }
}

/// Issues a low-cost `tools/list` probe against not-recently-probed
/// instances and reconciles the result into the Observation Store (§4.4).
pub struct HealthProber<P: AdapterProvider> {
    store: Arc<ObservationStore>,
    provider: Arc<P>,
    cfg: HealthProberConfig,
    ids: FrameIdGenerator,
    /// Consecutive-failure count per instance id, since the last recovery
    /// or the instance's first probe. Never populated for an instance that
    /// has never failed a probe.
    failures: Arc<DashMap<String, u32>>,
}

impl<P: AdapterProvider + 'static> HealthProber<P> {
    pub fn new(store: Arc<ObservationStore>, provider: Arc<P>, cfg: HealthProberConfig) -> Self {
        Self {
            store,
            provider,
            cfg,
            ids: FrameIdGenerator::new(),
            failures: Arc::new(DashMap::new()),
        }
    }

    fn is_fresh(&self, instance_id: &str) -> bool {
        self.store
            .get_health(instance_id)
            .map(|snapshot| snapshot.is_fresh(self.cfg.ttl.as_millis() as u64))
            .unwrap_or(false)
    }

    /// Probes every instance of `template` (or all instances if `None`)
    /// that isn't already within its TTL window. A cached result inside the
    /// TTL short-circuits without issuing a probe.
    pub async fn probe_all(&self, template: Option<&str>) -> Result<(), GatewayError> {
        let instances: Vec<Instance> = match template {
            Some(name) => self.store.list_instances_for_template(name),
            None => self.store.list_instances(),
        };

        let to_probe: Vec<Instance> = instances
            .into_iter()
            .filter(|i| !self.is_fresh(&i.id))
            .collect();

        if to_probe.is_empty() {
            return Ok(());
        }

        let permits = if self.cfg.fanout == 0 {
            to_probe.len().max(1)
        } else {
            self.cfg.fanout
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let probed = Arc::new(AtomicUsize::new(0));

        let mut set = JoinSet::new();
        for instance in to_probe {
            let store = Arc::clone(&self.store);
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let probed = Arc::clone(&probed);
            let failures = Arc::clone(&self.failures);
            let probe_timeout = self.cfg.probe_timeout;
            let degraded_after = self.cfg.degraded_after;
            let id = self.ids.next();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                probe_one(
                    &store,
                    provider.as_ref(),
                    &instance,
                    id,
                    probe_timeout,
                    &failures,
                    degraded_after,
                )
                .await;
                probed.fetch_add(1, Ordering::Relaxed);
            });
        }

        while set.join_next().await.is_some() {}
        debug!(count = probed.load(Ordering::Relaxed), "health probes completed");
        Ok(())
    }
}

async fn probe_one<P: AdapterProvider + ?Sized>(
    store: &ObservationStore,
    provider: &P,
    instance: &Instance,
    id: gateway_core::FrameId,
    probe_timeout: Duration,
    failures: &DashMap<String, u32>,
    degraded_after: u32,
) {
    let adapter = match provider.get(&instance.id, &instance.template).await {
        Ok(adapter) => adapter,
        Err(err) => {
            let _ = store.set_health(&instance.id, HealthSnapshot::failed(err.to_string()));
            record_failure(store, &instance.id, failures, degraded_after);
            return;
        }
    };

    let frame = gateway_core::McpFrame::request(id, "tools/list", serde_json::json!({}));
    let start = Instant::now();
    let snapshot = match adapter.send_and_receive(frame, probe_timeout).await {
        Ok(reply) if reply.is_failure() => {
            HealthSnapshot::failed(reply.error.map(|e| e.message).unwrap_or_default())
        }
        Ok(_) => HealthSnapshot::ok(start.elapsed().as_millis() as u64),
        Err(err) => HealthSnapshot::failed(err.to_string()),
    };
    let healthy = snapshot.healthy;
    let _ = store.set_health(&instance.id, snapshot);

    if healthy {
        record_recovery(store, &instance.id, failures);
    } else {
        record_failure(store, &instance.id, failures, degraded_after);
    }
}

/// Bumps the consecutive-failure count for `id` and, once it reaches
/// `degraded_after`, patches a still-`running` instance to `degraded`
/// (§4.3). A no-op for an instance already `degraded` or otherwise not
/// `running` (e.g. `stopped` mid-probe).
fn record_failure(store: &ObservationStore, id: &str, failures: &DashMap<String, u32>, degraded_after: u32) {
    let count = {
        let mut entry = failures.entry(id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    };
    if count < degraded_after {
        return;
    }
    if let Some(instance) = store.get_instance(id) {
        if instance.state == InstanceState::Running {
            let _ = store.patch_instance(
                id,
                InstancePatch {
                    state: Some(InstanceState::Degraded),
                    ..Default::default()
                },
            );
        }
    }
}

/// Clears `id`'s failure count and, if it was `degraded`, patches it back
/// to `running` (§4.3 "successful probe").
fn record_recovery(store: &ObservationStore, id: &str, failures: &DashMap<String, u32>) {
    failures.remove(id);
    if let Some(instance) = store.get_instance(id) {
        if instance.state == InstanceState::Degraded {
            let _ = store.patch_instance(
                id,
                InstancePatch {
                    state: Some(InstanceState::Running),
                    ..Default::default()
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{InstanceState, McpFrame, TransportKind};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration as StdDuration;

    fn template(name: &str) -> Template {
        Template {
            name: name.to_string(),
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

    struct AlwaysHealthy {
        calls: AtomicU64,
    }

    #[async_trait]
    impl TransportAdapter for AlwaysHealthy {
        async fn connect(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn send(&self, _frame: McpFrame) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn receive(&self) -> Result<McpFrame, GatewayError> {
            Err(GatewayError::Internal("unused".into()))
        }
        async fn disconnect(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn send_and_receive(
            &self,
            frame: McpFrame,
            _timeout: StdDuration,
        ) -> Result<McpFrame, GatewayError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(McpFrame::response_ok(frame.id.unwrap(), serde_json::json!([])))
        }
    }

    struct StubProvider {
        adapter: Arc<AlwaysHealthy>,
    }

    #[async_trait]
    impl AdapterProvider for StubProvider {
        async fn get(
            &self,
            _instance_id: &str,
            _template: &Template,
        ) -> Result<Arc<dyn TransportAdapter>, GatewayError> {
            Ok(self.adapter.clone())
        }
    }

    #[tokio::test]
    async fn probes_a_stale_instance_and_records_a_healthy_snapshot() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(template("svc-a")).unwrap();
        let mut instance = Instance::new("inst-1", template("svc-a"));
        instance.state = InstanceState::Running;
        store.set_instance(instance).unwrap();

        let provider = Arc::new(StubProvider {
            adapter: Arc::new(AlwaysHealthy { calls: AtomicU64::new(0) }),
        });
        let prober = HealthProber::new(store.clone(), provider, HealthProberConfig::default());
        prober.probe_all(Some("svc-a")).await.unwrap();

        let snapshot = store.get_health("inst-1").unwrap();
        assert!(snapshot.healthy);
    }

    #[tokio::test]
    async fn a_fresh_snapshot_is_not_reprobed() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(template("svc-a")).unwrap();
        let mut instance = Instance::new("inst-1", template("svc-a"));
        instance.state = InstanceState::Running;
        store.set_instance(instance).unwrap();
        store.set_health("inst-1", HealthSnapshot::ok(1)).unwrap();

        let adapter = Arc::new(AlwaysHealthy { calls: AtomicU64::new(0) });
        let provider = Arc::new(StubProvider { adapter: adapter.clone() });
        let prober = HealthProber::new(store, provider, HealthProberConfig::default());
        prober.probe_all(Some("svc-a")).await.unwrap();

        assert_eq!(adapter.calls.load(Ordering::Relaxed), 0);
    }

    struct AlwaysFailing;

    #[async_trait]
    impl TransportAdapter for AlwaysFailing {
        async fn connect(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn send(&self, _frame: McpFrame) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn receive(&self) -> Result<McpFrame, GatewayError> {
            Err(GatewayError::Internal("unused".into()))
        }
        async fn disconnect(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn send_and_receive(
            &self,
            frame: McpFrame,
            _timeout: StdDuration,
        ) -> Result<McpFrame, GatewayError> {
            Ok(McpFrame::response_err(
                frame.id.unwrap(),
                gateway_core::McpError {
                    code: -1,
                    message: "boom".to_string(),
                    data: None,
                },
            ))
        }
    }

    #[tokio::test]
    async fn running_degrades_after_enough_consecutive_failed_probes() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(template("svc-a")).unwrap();
        let mut instance = Instance::new("inst-1", template("svc-a"));
        instance.state = InstanceState::Running;
        store.set_instance(instance).unwrap();

        let provider = Arc::new(StubProvider { adapter: Arc::new(AlwaysFailing) });
        let cfg = HealthProberConfig {
            ttl: Duration::from_millis(0),
            degraded_after: 2,
            ..HealthProberConfig::default()
        };
        let prober = HealthProber::new(store.clone(), provider, cfg);

        prober.probe_all(Some("svc-a")).await.unwrap();
        assert_eq!(store.get_instance("inst-1").unwrap().state, InstanceState::Running);

        prober.probe_all(Some("svc-a")).await.unwrap();
        assert_eq!(store.get_instance("inst-1").unwrap().state, InstanceState::Degraded);
    }

    #[tokio::test]
    async fn degraded_recovers_to_running_on_a_successful_probe() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(template("svc-a")).unwrap();
        let mut instance = Instance::new("inst-1", template("svc-a"));
        instance.state = InstanceState::Degraded;
        store.set_instance(instance).unwrap();

        let provider = Arc::new(StubProvider {
            adapter: Arc::new(AlwaysHealthy { calls: AtomicU64::new(0) }),
        });
        let cfg = HealthProberConfig {
            ttl: Duration::from_millis(0),
            ..HealthProberConfig::default()
        };
        let prober = HealthProber::new(store.clone(), provider, cfg);

        prober.probe_all(Some("svc-a")).await.unwrap();
        assert_eq!(store.get_instance("inst-1").unwrap().state, InstanceState::Running);
    }
}
