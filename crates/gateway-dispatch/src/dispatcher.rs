use std::sync::Arc;
use std::time::{Duration, Instant};

use gateway_auth::{Authenticator, Credential, RateLimitBackend};
use gateway_core::{FrameIdGenerator, GatewayError, InstanceState, McpFrame};
use gateway_scheduling::{BackpressureController, LoadBalancer, Strategy};
use gateway_store::ObservationStore;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::pool::AdapterPool;

#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// How long a `healthy=false` snapshot keeps an instance excluded from
    /// the candidate set before it's treated as unknown again (§4.8 step 5).
    pub health_ttl: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            health_ttl: Duration::from_secs(5),
        }
    }
}

/// One inbound tool call, already resolved to a credential by `gateway-http`
/// (or a CLI/test caller). `required_permission` is `None` for endpoints
/// that only require a valid principal, not a specific capability.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub credential: Credential,
    pub rate_limit_subject: String,
    pub rate_limit_cost: u64,
    pub required_permission: Option<String>,
    pub template: String,
    pub method: String,
    pub params: Value,
    pub timeout: Duration,
    pub strategy: Strategy,
    /// Overrides `template.retries` for this call only, e.g. `gateway-http`'s
    /// `POST /api/tools/execute` `options.retries`. `None` defers to the
    /// template's own setting.
    pub retries_override: Option<u32>,
}

/// Runs the per-request pipeline of §4.8: authenticate, rate-limit, resolve
/// template, build a health-gated candidate set, pick an instance, acquire
/// backpressure, exchange one MCP frame through the Adapter Pool, record
/// metrics, release. Retries idempotent reads against a fresh pick on
/// connect/timeout failures, up to `template.retries` times.
pub struct Dispatcher {
    store: Arc<ObservationStore>,
    balancer: Arc<LoadBalancer>,
    backpressure: Arc<BackpressureController>,
    pool: Arc<AdapterPool>,
    authenticator: Arc<Authenticator>,
    rate_limiter: Arc<dyn RateLimitBackend>,
    cfg: DispatcherConfig,
    ids: FrameIdGenerator,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ObservationStore>,
        balancer: Arc<LoadBalancer>,
        backpressure: Arc<BackpressureController>,
        pool: Arc<AdapterPool>,
        authenticator: Arc<Authenticator>,
        rate_limiter: Arc<dyn RateLimitBackend>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            balancer,
            backpressure,
            pool,
            authenticator,
            rate_limiter,
            cfg,
            ids: FrameIdGenerator::new(),
        }
    }

    #[instrument(skip(self, req), fields(template = %req.template, method = %req.method))]
    pub async fn dispatch(&self, req: DispatchRequest) -> Result<McpFrame, GatewayError> {
        let principal = self.authenticator.authenticate(req.credential.clone())?;
        if let Some(required) = &req.required_permission {
            if !principal.has_permission(required) {
                return Err(GatewayError::Unauthorized {
                    reason: format!(
                        "principal `{}` lacks permission `{required}`",
                        principal.subject
                    ),
                });
            }
        }

        self.rate_limiter
            .check(&req.rate_limit_subject, req.rate_limit_cost)
            .await?;

        let template = self
            .store
            .get_template(&req.template)
            .ok_or_else(|| GatewayError::NotFound {
                what: format!("template `{}`", req.template),
            })?;

        let deadline = Instant::now() + req.timeout;
        let max_retries = req.retries_override.unwrap_or(template.retries);
        let mut attempts_left = max_retries + 1;
        let mut last_err: Option<GatewayError> = None;

        while attempts_left > 0 {
            attempts_left -= 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(last_err.unwrap_or(GatewayError::Timeout(req.timeout)));
            }

            match self.dispatch_once(&template, &req, remaining).await {
                Ok(frame) => return Ok(frame),
                Err(err) => {
                    let retry = attempts_left > 0
                        && gateway_core::is_idempotent_read(&req.method)
                        && err.retryable_by_dispatcher();
                    if !retry {
                        return Err(err);
                    }
                    debug!(error = %err, attempts_left, "retrying dispatch against a fresh pick");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(GatewayError::Internal(
            "dispatch exhausted its retry budget".to_string(),
        )))
    }

    async fn dispatch_once(
        &self,
        template: &gateway_core::Template,
        req: &DispatchRequest,
        remaining: Duration,
    ) -> Result<McpFrame, GatewayError> {
        let mut candidates = self.store.list_instances_for_template(&req.template);
        candidates.retain(|i| i.state == InstanceState::Running);
        candidates.retain(|i| match self.store.get_health(&i.id) {
            Some(health) if !health.healthy && health.is_fresh(self.cfg.health_ttl.as_millis() as u64) => false,
            _ => true,
        });

        let instance = self
            .balancer
            .pick_from(&req.template, req.strategy, &candidates)?;

        let lease = self.backpressure.acquire(&instance.id, remaining).await?;

        let adapter = match self.pool.get(&instance.id, &instance.template).await {
            Ok(adapter) => adapter,
            Err(err) => {
                self.backpressure.release(lease, false).await;
                return Err(err);
            }
        };

        let frame = McpFrame::request(self.ids.next(), req.method.clone(), req.params.clone());
        let call_timeout = remaining.min(Duration::from_millis(template.timeout_ms));

        let start = Instant::now();
        let outcome = adapter.send_and_receive(frame, call_timeout).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        let failed = !matches!(&outcome, Ok(reply) if !reply.is_failure());
        let _ = self.store.record_request(&instance.id, latency_ms, failed);

        self.backpressure.release(lease, !failed).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AdapterPoolConfig;
    use gateway_auth::{Principal, SlidingWindowRateLimiter};
    use gateway_core::{AuthMode, Instance, Template, TransportKind};
    use gateway_scheduling::BackpressureConfig;
    use std::collections::BTreeMap;

    fn echo_template(name: &str) -> Template {
        Template {
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
            timeout_ms: Template::default_timeout_ms(),
            retries: 0,
            trust_level: None,
        }
    }

    fn running_instance(store: &ObservationStore, id: &str, tmpl: Template) {
        let mut instance = Instance::new(id, tmpl);
        instance.state = InstanceState::Starting;
        store.set_instance(instance).unwrap();
        store
            .patch_instance(
                id,
                gateway_store::InstancePatch {
                    state: Some(InstanceState::Running),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    fn build_dispatcher(store: Arc<ObservationStore>) -> Dispatcher {
        let balancer = Arc::new(LoadBalancer::new(store.clone()));
        let backpressure = BackpressureController::new(BackpressureConfig::default());
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let authenticator = Arc::new(Authenticator::new(AuthMode::LocalTrusted));
        let rate_limiter = SlidingWindowRateLimiter::new(Default::default());
        Dispatcher::new(
            store,
            balancer,
            backpressure,
            pool,
            authenticator,
            rate_limiter,
            DispatcherConfig::default(),
        )
    }

    #[tokio::test]
    async fn dispatch_round_trips_an_mcp_frame_through_the_pool() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(echo_template("svc-a")).unwrap();
        running_instance(&store, "inst-1", echo_template("svc-a"));

        let dispatcher = build_dispatcher(store);
        let reply = dispatcher
            .dispatch(DispatchRequest {
                credential: Credential::Loopback,
                rate_limit_subject: "trusted-local".to_string(),
                rate_limit_cost: 1,
                required_permission: None,
                template: "svc-a".to_string(),
                method: "tools/list".to_string(),
                params: serde_json::json!({}),
                timeout: Duration::from_secs(2),
                strategy: Strategy::RoundRobin,
                retries_override: None,
            })
            .await
            .unwrap();
        assert!(!reply.is_failure());
    }

    #[tokio::test]
    async fn missing_template_fails_with_not_found() {
        let store = Arc::new(ObservationStore::new());
        let dispatcher = build_dispatcher(store);
        let result = dispatcher
            .dispatch(DispatchRequest {
                credential: Credential::Loopback,
                rate_limit_subject: "trusted-local".to_string(),
                rate_limit_cost: 1,
                required_permission: None,
                template: "ghost".to_string(),
                method: "tools/list".to_string(),
                params: serde_json::json!({}),
                timeout: Duration::from_secs(1),
                strategy: Strategy::RoundRobin,
                retries_override: None,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::NotFound { .. })));
    }

    #[tokio::test]
    async fn no_running_instances_fails_with_no_healthy_instance() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(echo_template("svc-a")).unwrap();
        let dispatcher = build_dispatcher(store);
        let result = dispatcher
            .dispatch(DispatchRequest {
                credential: Credential::Loopback,
                rate_limit_subject: "trusted-local".to_string(),
                rate_limit_cost: 1,
                required_permission: None,
                template: "svc-a".to_string(),
                method: "tools/list".to_string(),
                params: serde_json::json!({}),
                timeout: Duration::from_secs(1),
                strategy: Strategy::RoundRobin,
                retries_override: None,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::NoHealthyInstance { .. })));
    }

    #[tokio::test]
    async fn missing_permission_is_unauthorized_before_any_dispatch_work() {
        let store = Arc::new(ObservationStore::new());
        store.set_template(echo_template("svc-a")).unwrap();
        let balancer = Arc::new(LoadBalancer::new(store.clone()));
        let backpressure = BackpressureController::new(BackpressureConfig::default());
        let pool = AdapterPool::new(AdapterPoolConfig::default());
        let authenticator = Arc::new(Authenticator::new(AuthMode::ExternalSecure));
        authenticator.register(
            "scoped-key",
            Principal::scoped("svc-client", ["tools:read".to_string()]),
            None,
        );
        let rate_limiter = SlidingWindowRateLimiter::new(Default::default());
        let dispatcher = Dispatcher::new(
            store,
            balancer,
            backpressure,
            pool,
            authenticator,
            rate_limiter,
            DispatcherConfig::default(),
        );

        let result = dispatcher
            .dispatch(DispatchRequest {
                credential: Credential::ApiKey("scoped-key".to_string()),
                rate_limit_subject: "svc-client".to_string(),
                rate_limit_cost: 1,
                required_permission: Some("tools:execute".to_string()),
                template: "svc-a".to_string(),
                method: "tools/list".to_string(),
                params: serde_json::json!({}),
                timeout: Duration::from_secs(1),
                strategy: Strategy::RoundRobin,
                retries_override: None,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Unauthorized { .. })));
    }
}
