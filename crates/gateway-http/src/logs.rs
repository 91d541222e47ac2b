use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use gateway_bus::{EventBus, EventBusConfig, EventEnvelope};
use gateway_core::now_millis;
use gateway_store::{ChangeEvent, ObservationStore};
use serde::Serialize;
use tracing::debug;

/// A single entry on `/api/logs/stream`, derived from a store
/// [`ChangeEvent`] rather than from `tracing` directly (§6) — the HTTP
/// layer owns its own view of "what happened", independent of whatever a
/// given deployment's tracing subscriber is configured to emit.
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub emitted_at: u64,
    pub kind: &'static str,
    pub message: String,
}

impl From<&ChangeEvent> for LogEntry {
    fn from(event: &ChangeEvent) -> Self {
        let message = match event {
            ChangeEvent::TemplateSet(t) => format!("template `{}` set", t.name),
            ChangeEvent::TemplateRemove(name) => format!("template `{name}` removed"),
            ChangeEvent::InstanceSet(i) => format!("instance `{}` set ({:?})", i.id, i.state),
            ChangeEvent::InstanceRemove(id) => format!("instance `{id}` removed"),
            ChangeEvent::HealthUpdate(id, h) => {
                format!("instance `{id}` health updated (healthy={})", h.healthy)
            }
            ChangeEvent::HealthRemove(id) => format!("instance `{id}` health removed"),
            ChangeEvent::MetricsUpdate(id, _) => format!("instance `{id}` metrics updated"),
            ChangeEvent::MetricsRemove(id) => format!("instance `{id}` metrics removed"),
        };
        LogEntry {
            emitted_at: now_millis(),
            kind: event.kind(),
            message,
        }
    }
}

/// Bridges the Observation Store's own change-event subscription (§4.1)
/// into a dedicated [`EventBus<LogEntry>`] that `/api/logs/stream` reads
/// from, plus a small ring buffer so new SSE clients can backfill recent
/// history before switching to live delivery.
pub struct LogBroadcaster {
    bus: EventBus<LogEntry>,
    backlog: Mutex<VecDeque<EventEnvelope<LogEntry>>>,
    capacity: usize,
}

impl LogBroadcaster {
    /// Spawns the pump task that drains `store.subscribe()` for as long as
    /// the returned `Arc` (and the store) stay alive.
    pub fn spawn(store: Arc<ObservationStore>, capacity: usize) -> Arc<Self> {
        let broadcaster = Arc::new(Self {
            bus: EventBus::new(EventBusConfig::default()),
            backlog: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        });

        let mut rx = store.subscribe();
        let worker = Arc::clone(&broadcaster);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let entry = LogEntry::from(&event);
                let envelope = EventEnvelope::new(entry.clone());
                worker.push_backlog(envelope.clone());
                if let Err(err) = worker.bus.publish_with_id(envelope.id, entry).await {
                    debug!(%err, "log broadcaster failed to publish, bus likely shut down");
                    break;
                }
            }
        });

        broadcaster
    }

    fn push_backlog(&self, envelope: EventEnvelope<LogEntry>) {
        let mut backlog = self.backlog.lock().unwrap();
        if backlog.len() == self.capacity {
            backlog.pop_front();
        }
        backlog.push_back(envelope);
    }

    /// Snapshot of the ring buffer, oldest first, for SSE backfill.
    pub fn backfill(&self) -> Vec<EventEnvelope<LogEntry>> {
        self.backlog.lock().unwrap().iter().cloned().collect()
    }

    pub fn bus(&self) -> &EventBus<LogEntry> {
        &self.bus
    }

    pub fn shutdown(&self) {
        self.bus.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{Instance, Template, TransportKind};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    fn template(name: &str) -> Template {
        Template {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            transport: TransportKind::Subprocess,
            command: Some("sh".to_string()),
            args: vec![],
            env: BTreeMap::new(),
            base_url: None,
            auth: None,
            timeout_ms: Template::default_timeout_ms(),
            retries: 0,
            trust_level: None,
        }
    }

    #[tokio::test]
    async fn backfill_contains_entries_for_store_mutations() {
        let store = Arc::new(ObservationStore::new());
        let broadcaster = LogBroadcaster::spawn(store.clone(), 10);

        store.set_template(template("svc-a")).unwrap();
        sleep(Duration::from_millis(20)).await;

        let backfill = broadcaster.backfill();
        assert_eq!(backfill.len(), 1);
        assert_eq!(backfill[0].payload.kind, "template:set");
    }

    #[tokio::test]
    async fn backlog_never_exceeds_its_configured_capacity() {
        let store = Arc::new(ObservationStore::new());
        let broadcaster = LogBroadcaster::spawn(store.clone(), 2);

        for i in 0..5 {
            store
                .set_instance(Instance::new(format!("inst-{i}"), template("svc-a")))
                .unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(broadcaster.backfill().len(), 2);
    }

    #[tokio::test]
    async fn subscribers_receive_entries_published_after_they_subscribe() {
        let store = Arc::new(ObservationStore::new());
        let broadcaster = LogBroadcaster::spawn(store.clone(), 10);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = broadcaster.bus().subscribe(move |_: EventEnvelope<LogEntry>| {
            let count = Arc::clone(&count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        store.set_template(template("svc-a")).unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
