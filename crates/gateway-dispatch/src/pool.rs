use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use gateway_core::{GatewayError, Template};
use gateway_scheduling::AdapterProvider;
use gateway_transport::{build_adapter, TransportAdapter};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug)]
pub struct AdapterPoolConfig {
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for AdapterPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
        }
    }
}

struct PoolEntry {
    adapter: OnceCell<Arc<dyn TransportAdapter>>,
    last_used: Mutex<Instant>,
}

impl PoolEntry {
    fn new() -> Self {
        Self {
            adapter: OnceCell::new(),
            last_used: Mutex::new(Instant::now()),
        }
    }
}

/// Caches one connected adapter per instance id (§4.7). Concurrent callers
/// for the same id share a single connecting attempt: whichever caller wins
/// the `entries` insert race drives `OnceCell::get_or_try_init`'s
/// initializer, every other caller for that id awaits the same future
/// instead of dialing a second connection. A failed connect leaves the cell
/// uninitialized, so the next caller gets a fresh attempt rather than a
/// permanently poisoned entry.
pub struct AdapterPool {
    cfg: AdapterPoolConfig,
    entries: Arc<DashMap<String, Arc<PoolEntry>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterPool {
    pub fn new(cfg: AdapterPoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            cfg,
            entries: Arc::new(DashMap::new()),
            reaper: Mutex::new(None),
        });
        pool.clone().spawn_reaper();
        pool
    }

    fn spawn_reaper(self: Arc<Self>) {
        let entries = Arc::clone(&self.entries);
        let idle_timeout = self.cfg.idle_timeout;
        let interval = self.cfg.reap_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Snapshot the `Arc`s out of the dashmap first so no shard
                // guard is held while awaiting each entry's own mutex.
                let snapshot: Vec<(String, Arc<PoolEntry>)> = entries
                    .iter()
                    .map(|item| (item.key().clone(), Arc::clone(item.value())))
                    .collect();

                let mut stale = Vec::new();
                for (id, entry) in snapshot {
                    if entry.last_used.lock().await.elapsed() >= idle_timeout {
                        stale.push((id, entry));
                    }
                }

                for (id, entry) in stale {
                    entries.remove(&id);
                    if let Some(adapter) = entry.adapter.get() {
                        if let Err(err) = adapter.disconnect().await {
                            warn!(instance_id = %id, %err, "idle adapter disconnect failed");
                        }
                    }
                    debug!(instance_id = %id, "reaped idle adapter");
                }
            }
        });
        if let Ok(mut guard) = self.reaper.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Disconnects and forgets the adapter for `instance_id`, if any is
    /// cached. Safe to call when nothing is cached for that id.
    pub async fn release(&self, instance_id: &str) {
        if let Some((_, entry)) = self.entries.remove(instance_id) {
            if let Some(adapter) = entry.adapter.get() {
                if let Err(err) = adapter.disconnect().await {
                    warn!(%instance_id, %err, "adapter disconnect failed on release");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.release(&id).await;
        }
    }
}

#[async_trait]
impl AdapterProvider for AdapterPool {
    async fn get(
        &self,
        instance_id: &str,
        template: &Template,
    ) -> Result<Arc<dyn TransportAdapter>, GatewayError> {
        let entry = Arc::clone(
            self.entries
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(PoolEntry::new()))
                .value(),
        );
        *entry.last_used.lock().await = Instant::now();

        let owned_id = instance_id.to_string();
        let owned_template = template.clone();
        let adapter = entry
            .adapter
            .get_or_try_init(|| async move {
                let adapter = build_adapter(owned_id, &owned_template)?;
                adapter.connect().await?;
                Ok::<Arc<dyn TransportAdapter>, GatewayError>(Arc::from(adapter))
            })
            .await?;

        Ok(Arc::clone(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::TransportKind;
    use std::collections::BTreeMap;

    fn echo_template() -> Template {
        Template {
            name: "svc-echo".to_string(),
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
            timeout_ms: Template::default_timeout_ms(),
            retries: 0,
            trust_level: None,
        }
    }

    #[tokio::test]
    async fn get_caches_the_adapter_across_calls() {
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let tmpl = echo_template();
        let first = pool.get("inst-1", &tmpl).await.unwrap();
        let second = pool.get("inst-1", &tmpl).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn release_disconnects_and_forgets_the_adapter() {
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let tmpl = echo_template();
        pool.get("inst-1", &tmpl).await.unwrap();
        pool.release("inst-1").await;
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_for_the_same_id_share_one_connection() {
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let tmpl = echo_template();

        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let tmpl = tmpl.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                pool.get("inst-1", &tmpl).await.unwrap()
            }));
        }
        let mut adapters = Vec::new();
        for handle in handles {
            adapters.push(handle.await.unwrap());
        }
        for adapter in &adapters[1..] {
            assert!(Arc::ptr_eq(&adapters[0], adapter));
        }
        assert_eq!(pool.len(), 1);
    }
}
