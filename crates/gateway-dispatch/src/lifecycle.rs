use std::sync::Arc;

use dashmap::DashMap;
use gateway_core::{GatewayError, Instance, InstanceState};
use gateway_scheduling::AdapterProvider;
use gateway_store::{InstancePatch, ObservationStore};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use ulid::Ulid;

use crate::pool::AdapterPool;

/// Drives the `idle -> starting -> running/failed` and `any -> stopped`
/// edges of §4.3 that the Dispatcher itself never takes — §4.8 step 4
/// calls starting an instance from a template "outside core". `gateway-http`
/// calls this directly from the `/api/services` handlers; nothing about it
/// is HTTP-specific.
pub struct InstanceLifecycle {
    store: Arc<ObservationStore>,
    pool: Arc<AdapterPool>,
    /// One watcher task per running instance, awaiting its adapter's
    /// `wait_for_exit`. Aborted by `stop` so an intentional shutdown never
    /// races a `lifecycle:exit` report for the same instance.
    exit_watchers: DashMap<String, JoinHandle<()>>,
}

impl InstanceLifecycle {
    pub fn new(store: Arc<ObservationStore>, pool: Arc<AdapterPool>) -> Self {
        Self {
            store,
            pool,
            exit_watchers: DashMap::new(),
        }
    }

    /// Spawns the task that reports an unprompted backend exit (§4.2/§4.3
    /// "lifecycle:exit") to the store. Only fires once per adapter
    /// lifetime — `disconnect()` makes `wait_for_exit` hang forever
    /// instead of resolving, so this never races `stop`.
    fn watch_for_exit(&self, id: String, adapter: Arc<dyn gateway_transport::TransportAdapter>) {
        let store = Arc::clone(&self.store);
        let watch_id = id.clone();
        let handle = tokio::spawn(async move {
            let exit_code = adapter.wait_for_exit().await;
            warn!(instance_id = %watch_id, ?exit_code, "backend process exited unexpectedly");
            if let Err(err) = store.mark_instance_exited(&watch_id, exit_code) {
                warn!(instance_id = %watch_id, %err, "failed to record unexpected instance exit");
            }
        });
        self.exit_watchers.insert(id, handle);
    }

    /// Mints a fresh instance id for `template_name`, records it `starting`,
    /// then tries to connect through the Adapter Pool. Settles into
    /// `running` on success or `failed` on connect error, per §4.3.
    #[instrument(skip(self))]
    pub async fn start(&self, template_name: &str) -> Result<Instance, GatewayError> {
        let template = self
            .store
            .get_template(template_name)
            .ok_or_else(|| GatewayError::NotFound {
                what: format!("template `{template_name}`"),
            })?;

        let id = format!("{template_name}-{}", Ulid::new());
        self.store.set_instance(Instance::new(&id, template.clone()))?;
        self.store.patch_instance(
            &id,
            InstancePatch {
                state: Some(InstanceState::Starting),
                ..Default::default()
            },
        )?;

        match self.pool.get(&id, &template).await {
            Ok(adapter) => {
                self.store.patch_instance(
                    &id,
                    InstancePatch {
                        state: Some(InstanceState::Running),
                        ..Default::default()
                    },
                )?;
                info!(instance_id = %id, template = %template_name, "instance started");
                self.watch_for_exit(id.clone(), adapter);
            }
            Err(err) => {
                self.store.patch_instance(
                    &id,
                    InstancePatch {
                        state: Some(InstanceState::Failed),
                        ..Default::default()
                    },
                )?;
                warn!(instance_id = %id, template = %template_name, %err, "instance failed to start");
                return Err(err);
            }
        }

        self.store.get_instance(&id).ok_or_else(|| {
            GatewayError::Internal("instance vanished immediately after starting".to_string())
        })
    }

    /// Disconnects the pooled adapter (if any) and marks the instance
    /// `stopped`. `stopped` is terminal (§4.3); a new id is minted to retry.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<(), GatewayError> {
        self.store
            .get_instance(id)
            .ok_or_else(|| GatewayError::NotFound {
                what: format!("instance `{id}`"),
            })?;

        if let Some((_, handle)) = self.exit_watchers.remove(id) {
            handle.abort();
        }
        self.pool.release(id).await;
        self.store.patch_instance(
            id,
            InstancePatch {
                state: Some(InstanceState::Stopped),
                ..Default::default()
            },
        )?;
        info!(instance_id = %id, "instance stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AdapterPoolConfig;
    use gateway_core::TransportKind;
    use std::collections::BTreeMap;

    fn echo_template(name: &str) -> gateway_core::Template {
        gateway_core::Template {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            transport: TransportKind::Subprocess,
            command: Some("sh".to_string()),
            args: vec![
                "-c".to_string(),
                "read _line; printf '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\\n'"
                    .to_string(),
            ],
            env: BTreeMap::new(),
            base_url: None,
            auth: None,
            timeout_ms: gateway_core::Template::default_timeout_ms(),
            retries: 0,
            trust_level: None,
        }
    }

    #[tokio::test]
    async fn start_settles_into_running_on_a_successful_connect() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(echo_template("svc-a")).unwrap();
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let lifecycle = InstanceLifecycle::new(store.clone(), pool);

        let instance = lifecycle.start("svc-a").await.unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(store.get_instance(&instance.id).unwrap().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn start_settles_into_failed_on_a_bad_command() {
        let store = Arc::new(ObservationStore::new());
        let mut bad = echo_template("svc-bad");
        bad.command = Some("/no/such/binary-ever".to_string());
        store.set_template(bad).unwrap();
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let lifecycle = InstanceLifecycle::new(store.clone(), pool);

        let result = lifecycle.start("svc-bad").await;
        assert!(result.is_err());
        let instances = store.list_instances_for_template("svc-bad");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Failed);
    }

    #[tokio::test]
    async fn start_fails_with_not_found_for_an_unknown_template() {
        let store = Arc::new(ObservationStore::new());
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let lifecycle = InstanceLifecycle::new(store, pool);

        let result = lifecycle.start("ghost").await;
        assert!(matches!(result, Err(GatewayError::NotFound { .. })));
    }

    #[tokio::test]
    async fn stop_releases_the_pooled_adapter_and_marks_stopped() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(echo_template("svc-a")).unwrap();
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let lifecycle = InstanceLifecycle::new(store.clone(), pool.clone());

        let instance = lifecycle.start("svc-a").await.unwrap();
        assert_eq!(pool.len(), 1);

        lifecycle.stop(&instance.id).await.unwrap();
        assert_eq!(pool.len(), 0);
        assert_eq!(store.get_instance(&instance.id).unwrap().state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn an_unprompted_backend_crash_settles_into_failed_and_emits_lifecycle_exit() {
        let store = Arc::new(ObservationStore::new());
        let mut rx = store.subscribe();
        let mut crashy = echo_template("svc-crashy");
        crashy.command = Some("sh".to_string());
        crashy.args = vec!["-c".to_string(), "exit 9".to_string()];
        store.set_template(crashy).unwrap();
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let lifecycle = InstanceLifecycle::new(store.clone(), pool);

        let instance = lifecycle.start("svc-crashy").await.unwrap();

        let saw_exit_event = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await.unwrap() {
                    gateway_store::ChangeEvent::InstanceExit(id, code) if id == instance.id => {
                        return code;
                    }
                    _ => continue,
                }
            }
        })
        .await
        .expect("lifecycle:exit should be emitted promptly");

        assert_eq!(saw_exit_event, Some(9));
        assert_eq!(store.get_instance(&instance.id).unwrap().state, InstanceState::Failed);
    }

    #[tokio::test]
    async fn stopping_an_instance_does_not_report_its_own_kill_as_a_crash() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(echo_template("svc-a")).unwrap();
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let lifecycle = InstanceLifecycle::new(store.clone(), pool);

        let instance = lifecycle.start("svc-a").await.unwrap();
        lifecycle.stop(&instance.id).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(store.get_instance(&instance.id).unwrap().state, InstanceState::Stopped);
    }
}
