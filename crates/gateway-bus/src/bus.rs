use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gateway_core::{now_millis, GatewayError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use ulid::Ulid;

use crate::dedup::RecentIdWindow;
use crate::envelope::EventEnvelope;

/// Tuning knobs for an [`EventBus`] (§4.10). Defaults mirror
/// `GatewayConfig`'s `event_bus_*` fields.
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub queue_depth: usize,
    pub subscriber_buffer: usize,
    pub handler_timeout: Duration,
    pub dedup_window: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            subscriber_buffer: 16,
            handler_timeout: Duration::from_secs(2),
            dedup_window: 256,
        }
    }
}

struct SubscriberHandle<T> {
    id: u64,
    tx: mpsc::Sender<EventEnvelope<T>>,
}

// Implemented by hand rather than `#[derive(Clone)]` so this doesn't pick up
// a spurious `T: Clone` bound — `mpsc::Sender<T>` clones regardless of `T`.
impl<T> Clone for SubscriberHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

type Subscribers<T> = Arc<Mutex<Vec<SubscriberHandle<T>>>>;

struct Inner<T> {
    central_tx: mpsc::Sender<EventEnvelope<T>>,
    subscribers: Subscribers<T>,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    subscriber_buffer: usize,
    handler_timeout: Duration,
}

/// A bounded, deduplicating event bus. Cloning an `EventBus` shares the same
/// central queue and subscriber set (it's a thin `Arc` handle).
pub struct EventBus<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> EventBus<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(config: EventBusConfig) -> Self {
        let (central_tx, mut central_rx) = mpsc::channel::<EventEnvelope<T>>(config.queue_depth);
        let subscribers: Subscribers<T> = Arc::new(Mutex::new(Vec::new()));

        let dispatcher_subscribers = Arc::clone(&subscribers);
        let mut dedup = RecentIdWindow::with_capacity(config.dedup_window);
        let subscriber_buffer = config.subscriber_buffer;
        let handler_timeout = config.handler_timeout;
        let dispatcher = tokio::spawn(async move {
            while let Some(envelope) = central_rx.recv().await {
                if dedup.insert(&envelope.id) {
                    continue;
                }

                let snapshot = dispatcher_subscribers.lock().unwrap().clone();
                let mut closed = Vec::new();
                for sub in &snapshot {
                    match sub.tx.try_send(envelope.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(subscriber = sub.id, "event bus subscriber queue full, dropping event");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            closed.push(sub.id);
                        }
                    }
                }
                if !closed.is_empty() {
                    dispatcher_subscribers
                        .lock()
                        .unwrap()
                        .retain(|sub| !closed.contains(&sub.id));
                }
            }
        });

        Self {
            inner: Arc::new(Inner {
                central_tx,
                subscribers,
                next_id: AtomicU64::new(1),
                dispatcher: Mutex::new(Some(dispatcher)),
                subscriber_buffer,
                handler_timeout,
            }),
        }
    }

    /// Publishes a new event with a freshly generated id.
    pub async fn publish(&self, payload: T) -> Result<(), GatewayError> {
        self.publish_with_id(Ulid::new().to_string(), payload).await
    }

    /// Publishes with a caller-chosen id, letting producers that may retry
    /// (and would otherwise re-publish the same logical event) rely on the
    /// bus's dedup window to collapse the duplicate.
    pub async fn publish_with_id(&self, id: impl Into<String>, payload: T) -> Result<(), GatewayError> {
        let envelope = EventEnvelope {
            id: id.into(),
            emitted_at: now_millis(),
            payload,
        };
        self.inner
            .central_tx
            .send(envelope)
            .await
            .map_err(|_| GatewayError::Internal("event bus dispatcher has stopped".to_string()))
    }

    /// Registers a handler that runs in its own task against its own
    /// bounded queue. A slow handler only ever affects its own
    /// subscription's lag, never another subscriber's delivery.
    pub fn subscribe<F, Fut>(&self, handler: F) -> Subscription<T>
    where
        F: Fn(EventEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel(self.inner.subscriber_buffer);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push(SubscriberHandle { id, tx });

        let timeout = self.inner.handler_timeout;
        let task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if tokio::time::timeout(timeout, handler(envelope)).await.is_err() {
                    warn!(subscriber = id, "event bus handler exceeded its timeout");
                }
            }
        });

        Subscription {
            id,
            task: Some(task),
            subscribers: Arc::clone(&self.inner.subscribers),
        }
    }

    /// Stops the dispatcher and drops every subscriber's sender, which
    /// closes each subscriber's channel and lets its consumer task end on
    /// its own next `recv()`.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.dispatcher.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.subscribers.lock().unwrap().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }
}

/// A live subscription. Dropping it (or calling [`Subscription::unsubscribe`]
/// explicitly) removes the subscriber from the bus and aborts its task.
pub struct Subscription<T> {
    id: u64,
    task: Option<JoinHandle<()>>,
    subscribers: Subscribers<T>,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(self) {
        // Drop does the work; this just gives callers an intention-revealing name.
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.subscribers.lock().unwrap().retain(|sub| sub.id != self.id);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus: EventBus<String> = EventBus::new(EventBusConfig::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);

        let _sub = bus.subscribe(move |envelope: EventEnvelope<String>| {
            let received = Arc::clone(&received_clone);
            async move {
                received.lock().unwrap().push(envelope.payload);
            }
        });

        bus.publish("hello".to_string()).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(*received.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_delivered_only_once() {
        let bus: EventBus<u32> = EventBus::new(EventBusConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_: EventEnvelope<u32>| {
            let count = Arc::clone(&count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.publish_with_id("dup-1", 1).await.unwrap();
        bus.publish_with_id("dup-1", 1).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_slow_subscriber_does_not_block_another() {
        let bus: EventBus<u32> = EventBus::new(EventBusConfig::default());
        let fast_count = Arc::new(AtomicUsize::new(0));
        let fast_clone = Arc::clone(&fast_count);

        let _slow = bus.subscribe(|_: EventEnvelope<u32>| async {
            sleep(Duration::from_secs(10)).await;
        });
        let _fast = bus.subscribe(move |_: EventEnvelope<u32>| {
            let fast_count = Arc::clone(&fast_clone);
            async move {
                fast_count.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.publish(1).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(fast_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribing_stops_further_delivery() {
        let bus: EventBus<u32> = EventBus::new(EventBusConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let sub = bus.subscribe(move |_: EventEnvelope<u32>| {
            let count = Arc::clone(&count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(1).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
