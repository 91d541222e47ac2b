use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gateway_core::GatewayError;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Per-instance flow control (§4.6): a token bucket gates throughput, a
/// bounded FIFO queue smooths bursts, and a circuit breaker stops sending
/// load to an instance that is failing outright.
#[derive(Clone, Copy, Debug)]
pub struct BackpressureConfig {
    pub bucket_capacity: f64,
    pub refill_per_sec: f64,
    pub queue_depth: usize,
    pub tick_interval: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_window: Duration,
    pub breaker_cooldown: Duration,
    pub breaker_half_open_probes: u32,
    pub breaker_half_open_successes_to_close: u32,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 10.0,
            refill_per_sec: 5.0,
            queue_depth: 64,
            tick_interval: Duration::from_millis(50),
            breaker_failure_threshold: 5,
            breaker_window: Duration::from_secs(30),
            breaker_cooldown: Duration::from_secs(15),
            breaker_half_open_probes: 1,
            breaker_half_open_successes_to_close: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
    half_open_successes: u32,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            half_open_inflight: 0,
            half_open_successes: 0,
        }
    }

    /// Call before admitting a new request. Handles the `OPEN` ->
    /// `HALF_OPEN` cooldown transition and the half-open probe budget.
    fn admit(&mut self, cfg: &BackpressureConfig) -> Result<(), ()> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= cfg.breaker_cooldown {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_inflight = 0;
                    self.half_open_successes = 0;
                    self.admit(cfg)
                } else {
                    Err(())
                }
            }
            BreakerState::HalfOpen => {
                if self.half_open_inflight < cfg.breaker_half_open_probes {
                    self.half_open_inflight += 1;
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    fn record(&mut self, success: bool, cfg: &BackpressureConfig) {
        match self.state {
            BreakerState::Closed => {
                if success {
                    self.prune_failures(cfg.breaker_window);
                    return;
                }
                let now = Instant::now();
                self.failures.push_back(now);
                self.prune_failures(cfg.breaker_window);
                if self.failures.len() as u32 >= cfg.breaker_failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    self.failures.clear();
                }
            }
            BreakerState::HalfOpen => {
                self.half_open_inflight = self.half_open_inflight.saturating_sub(1);
                if success {
                    self.half_open_successes += 1;
                    if self.half_open_successes >= cfg.breaker_half_open_successes_to_close {
                        self.state = BreakerState::Closed;
                        self.failures.clear();
                        self.opened_at = None;
                    }
                } else {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                    self.half_open_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn prune_failures(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct InstanceState {
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Waiter>,
    breaker: Breaker,
}

impl InstanceState {
    fn new(cfg: &BackpressureConfig) -> Self {
        Self {
            tokens: cfg.bucket_capacity,
            last_refill: Instant::now(),
            queue: VecDeque::new(),
            breaker: Breaker::new(),
        }
    }

    fn refill(&mut self, cfg: &BackpressureConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * cfg.refill_per_sec).min(cfg.bucket_capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, cfg: &BackpressureConfig) -> bool {
        self.refill(cfg);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A held token for one instance. Must be released via
/// [`BackpressureController::release`] exactly once.
pub struct Lease {
    instance_id: String,
    half_open_probe: bool,
}

/// Owns one [`InstanceState`] per instance id and a background ticker task
/// that refills buckets and grants queued waiters as tokens become
/// available (§4.6's "periodic ticker ≤ 50ms").
pub struct BackpressureController {
    cfg: BackpressureConfig,
    instances: Arc<DashMap<String, Arc<Mutex<InstanceState>>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    next_waiter_id: std::sync::atomic::AtomicU64,
}

impl BackpressureController {
    pub fn new(cfg: BackpressureConfig) -> Arc<Self> {
        let controller = Arc::new(Self {
            cfg,
            instances: Arc::new(DashMap::new()),
            ticker: Mutex::new(None),
            next_waiter_id: std::sync::atomic::AtomicU64::new(0),
        });
        controller.clone().spawn_ticker();
        controller
    }

    fn spawn_ticker(self: Arc<Self>) {
        let interval = self.cfg.tick_interval;
        let instances = Arc::clone(&self.instances);
        let cfg = self.cfg;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Clone the per-instance `Arc`s out before locking any of
                // them, so the dashmap shard guard is never held across an
                // `.await` (a lock a concurrent `acquire()` also needs).
                let snapshot: Vec<(String, Arc<Mutex<InstanceState>>)> = instances
                    .iter()
                    .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
                    .collect();

                for (instance_id, handle) in snapshot {
                    let mut state = handle.lock().await;
                    state.refill(&cfg);
                    while state.tokens >= 1.0 {
                        let Some(waiter) = state.queue.pop_front() else {
                            break;
                        };
                        state.tokens -= 1.0;
                        if waiter.tx.send(()).is_err() {
                            debug!(%instance_id, "queued waiter dropped before grant");
                        }
                    }
                }
            }
        });
        // Fire-and-forget: the caller holds the only `Arc`, this task lives
        // with it. Stashed so a future `shutdown` can abort it cleanly.
        if let Ok(mut guard) = self.ticker.try_lock() {
            *guard = Some(handle);
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    /// Acquires one lease for `instance_id`, waiting up to `timeout` if the
    /// bucket is momentarily empty. Fails fast with `BreakerOpen` or
    /// `QueueFull` rather than waiting in those cases.
    pub async fn acquire(&self, instance_id: &str, timeout: Duration) -> Result<Lease, GatewayError> {
        let map = Arc::clone(
            self.instances
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(InstanceState::new(&self.cfg))))
                .value(),
        );

        let (half_open_probe, immediate) = {
            let mut state = map.lock().await;
            if state.breaker.admit(&self.cfg).is_err() {
                return Err(GatewayError::BreakerOpen {
                    instance_id: instance_id.to_string(),
                });
            }
            let half_open_probe = state.breaker.state == BreakerState::HalfOpen;
            let immediate = state.try_take(&self.cfg);
            (half_open_probe, immediate)
        };

        if immediate {
            return Ok(Lease {
                instance_id: instance_id.to_string(),
                half_open_probe,
            });
        }

        let (tx, rx) = oneshot::channel();
        let waiter_id = self
            .next_waiter_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        {
            let mut state = map.lock().await;
            if state.queue.len() >= self.cfg.queue_depth {
                // Undo the admit() side effect so a queue-full rejection
                // doesn't leak a half-open probe slot.
                if half_open_probe {
                    state.breaker.half_open_inflight = state.breaker.half_open_inflight.saturating_sub(1);
                }
                return Err(GatewayError::QueueFull {
                    instance_id: instance_id.to_string(),
                });
            }
            state.queue.push_back(Waiter { id: waiter_id, tx });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(Lease {
                instance_id: instance_id.to_string(),
                half_open_probe,
            }),
            Ok(Err(_)) => Err(GatewayError::Internal(
                "backpressure controller dropped a grant channel".to_string(),
            )),
            Err(_) => {
                let mut state = map.lock().await;
                state.queue.retain(|w| w.id != waiter_id);
                if half_open_probe {
                    state.breaker.half_open_inflight = state.breaker.half_open_inflight.saturating_sub(1);
                }
                Err(GatewayError::Timeout(timeout))
            }
        }
    }

    /// Records the outcome of a leased request against the breaker.
    pub async fn release(&self, lease: Lease, success: bool) {
        let handle = self.instances.get(&lease.instance_id).map(|e| Arc::clone(e.value()));
        match handle {
            Some(handle) => {
                let mut state = handle.lock().await;
                state.breaker.record(success, &self.cfg);
            }
            None => warn!(instance_id = %lease.instance_id, "released a lease for an unknown instance"),
        }
    }

    pub async fn breaker_state(&self, instance_id: &str) -> Option<BreakerState> {
        let handle = self.instances.get(instance_id).map(|e| Arc::clone(e.value()))?;
        Some(handle.lock().await.breaker.state)
    }
}
