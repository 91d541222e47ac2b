#![forbid(unsafe_code)]
//! Wires every component into a running gateway: Observation Store, Load
//! Balancer, Backpressure Controller, Health Prober, Adapter Pool,
//! Dispatcher, Instance Lifecycle, Authenticator, rate limiter, Event Bus
//! log bridge, and the HTTP control surface.

use std::sync::Arc;
use std::time::Duration;

use gateway_auth::{Authenticator, RateLimiterConfig, SlidingWindowRateLimiter};
use gateway_core::GatewayConfig;
use gateway_dispatch::{AdapterPool, AdapterPoolConfig, Dispatcher, DispatcherConfig, InstanceLifecycle};
use gateway_http::{AppState, LogBroadcaster};
use gateway_scheduling::{BackpressureConfig, BackpressureController, HealthProber, HealthProberConfig, LoadBalancer};
use gateway_store::ObservationStore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env();
    init_tracing(&config.log_level);

    tracing::info!(host = %config.host, port = config.port, "starting gateway");

    let store = Arc::new(ObservationStore::new());

    for template in gateway_http::load_templates_dir(&config.templates_dir).await? {
        tracing::info!(template = %template.name, "loaded persisted template");
        store.set_template(template)?;
    }

    let balancer = Arc::new(LoadBalancer::new(store.clone()));
    let backpressure = BackpressureController::new(BackpressureConfig::default());
    let pool = AdapterPool::new(AdapterPoolConfig::default());
    let authenticator = Arc::new(Authenticator::new(config.auth_mode));
    let rate_limiter = SlidingWindowRateLimiter::new(RateLimiterConfig::default());

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        balancer.clone(),
        backpressure.clone(),
        pool.clone(),
        authenticator.clone(),
        rate_limiter.clone(),
        DispatcherConfig::default(),
    ));
    let lifecycle = Arc::new(InstanceLifecycle::new(store.clone(), pool.clone()));
    let log_broadcaster = LogBroadcaster::spawn(store.clone(), 256);

    let prober_handle = spawn_health_prober(store.clone(), pool.clone(), &config);

    let state = AppState {
        store,
        balancer,
        dispatcher,
        lifecycle,
        authenticator,
        log_broadcaster: log_broadcaster.clone(),
        auth_mode: config.auth_mode,
        templates_dir: config.templates_dir.clone(),
    };

    let router = gateway_http::app(state, Duration::from_secs(30));
    gateway_http::serve(&config.host, config.port, router, config.shutdown_grace).await?;

    prober_handle.abort();
    log_broadcaster.shutdown();
    rate_limiter.shutdown();
    pool.shutdown().await;
    tracing::info!("gateway shutdown complete");
    Ok(())
}

/// Runs `probe_all` on a fixed tick so every instance is re-checked at
/// roughly its configured TTL (§4.4). The returned handle is aborted on
/// shutdown (§4.12 "the health prober's ticker stops").
fn spawn_health_prober(
    store: Arc<ObservationStore>,
    pool: Arc<AdapterPool>,
    config: &GatewayConfig,
) -> tokio::task::JoinHandle<()> {
    let prober_cfg = HealthProberConfig {
        ttl: config.health_probe_ttl,
        fanout: config.health_probe_fanout,
        ..HealthProberConfig::default()
    };
    let tick = config.health_probe_ttl;
    tokio::spawn(async move {
        let prober = HealthProber::new(store, pool, prober_cfg);
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            if let Err(err) = prober.probe_all(None).await {
                tracing::warn!(%err, "health probe sweep failed");
            }
        }
    })
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
