use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use gateway_auth::Principal;
use gateway_core::{GatewayError, Instance, Template};
use gateway_dispatch::DispatchRequest;
use gateway_scheduling::Strategy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::auth::extract_credential;
use crate::error::ApiError;
use crate::logs::LogEntry;
use crate::persistence;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/templates", post(create_template).get(list_templates))
        .route(
            "/api/templates/:name",
            get(get_template).delete(delete_template),
        )
        .route("/api/services", post(start_service).get(list_services))
        .route("/api/services/:id", get(get_service).delete(stop_service))
        .route("/api/route", post(route_only))
        .route("/api/tools/execute", post(execute_tool))
        .route("/api/logs/stream", get(stream_logs))
        .with_state(state)
}

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    peer: SocketAddr,
    required_permission: Option<&str>,
) -> Result<Principal, ApiError> {
    let credential = extract_credential(headers, peer).ok_or_else(|| {
        ApiError::from(GatewayError::Unauthorized {
            reason: "no credential supplied".to_string(),
        })
    })?;
    let principal = state.authenticator.authenticate(credential)?;
    if let Some(required) = required_permission {
        if !principal.has_permission(required) {
            return Err(GatewayError::Unauthorized {
                reason: format!("principal `{}` lacks permission `{required}`", principal.subject),
            }
            .into());
        }
    }
    Ok(principal)
}

/// `GET /health` bypasses authentication entirely (§6, §8 scenario 6) —
/// liveness has to be checkable before a caller has any credential to
/// present.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "success": true, "status": "ok" }))
}

async fn create_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(template): Json<Template>,
) -> Result<(StatusCode, Json<Template>), ApiError> {
    authenticate(&state, &headers, peer, Some("templates:write"))?;
    template
        .validate()
        .map_err(GatewayError::Internal)
        .map_err(ApiError::from)?;

    state.store.set_template(template.clone())?;
    persistence::save_template(&state.templates_dir, &template)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;

    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_templates(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<Vec<Template>>, ApiError> {
    authenticate(&state, &headers, peer, None)?;
    Ok(Json(state.store.list_templates()))
}

async fn get_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
) -> Result<Json<Template>, ApiError> {
    authenticate(&state, &headers, peer, None)?;
    state
        .store
        .get_template(&name)
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound { what: format!("template `{name}`") }.into())
}

async fn delete_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    authenticate(&state, &headers, peer, Some("templates:write"))?;
    state.store.remove_template(&name)?;
    persistence::delete_template(&state.templates_dir, &name)
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct StartServiceRequest {
    #[serde(rename = "templateName")]
    template_name: String,
}

async fn start_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<StartServiceRequest>,
) -> Result<(StatusCode, Json<Instance>), ApiError> {
    authenticate(&state, &headers, peer, Some("services:start"))?;
    let instance = state.lifecycle.start(&body.template_name).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn list_services(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<Vec<Instance>>, ApiError> {
    authenticate(&state, &headers, peer, None)?;
    Ok(Json(state.store.list_instances()))
}

async fn get_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    authenticate(&state, &headers, peer, None)?;
    state
        .store
        .get_instance(&id)
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound { what: format!("instance `{id}`") }.into())
}

async fn stop_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authenticate(&state, &headers, peer, Some("services:start"))?;
    state.lifecycle.stop(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RouteRequest {
    #[serde(rename = "templateName")]
    template_name: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    strategy: Option<String>,
}

#[derive(Serialize)]
struct RouteResponse {
    success: bool,
    #[serde(rename = "selectedService")]
    selected_service: Instance,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
}

fn parse_strategy(raw: Option<&str>) -> Strategy {
    match raw {
        Some("performance") => Strategy::Performance,
        Some("least-loaded") => Strategy::LeastLoaded,
        Some("cost") => Strategy::Cost,
        Some("content-aware") => Strategy::ContentAware,
        _ => Strategy::RoundRobin,
    }
}

/// `POST /api/route` — picks an instance without executing against it
/// (§8 scenario 1). The distilled spec's example body only names `method`;
/// a `templateName` is required here too since the balancer has to know
/// which template's instances to choose among.
async fn route_only(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<RouteRequest>,
) -> Result<Json<RouteResponse>, ApiError> {
    authenticate(&state, &headers, peer, None)?;
    let strategy = parse_strategy(body.strategy.as_deref());
    let selected = state.balancer.pick(&body.template_name, strategy)?;
    Ok(Json(RouteResponse {
        success: true,
        selected_service: selected,
        method: body.method,
    }))
}

#[derive(Deserialize)]
struct ExecuteToolRequest {
    #[serde(rename = "toolId")]
    tool_id: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    options: ExecuteOptions,
}

#[derive(Deserialize, Default)]
struct ExecuteOptions {
    retries: Option<u32>,
}

#[derive(Serialize)]
struct ExecuteToolResponse {
    success: bool,
    result: Value,
}

/// `POST /api/tools/execute` — the one endpoint that actually talks to a
/// backend (§8 scenario 2 asserts a 500 here on a broken backend, with a
/// metrics increment). `toolId` names the template; `tools/call` is the
/// only method this endpoint issues.
async fn execute_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<ExecuteToolRequest>,
) -> Result<Json<ExecuteToolResponse>, ApiError> {
    let credential = extract_credential(&headers, peer).ok_or_else(|| {
        ApiError::from(GatewayError::Unauthorized {
            reason: "no credential supplied".to_string(),
        })
    })?;
    let principal = state.authenticator.authenticate(credential.clone())?;

    let reply = state
        .dispatcher
        .dispatch(DispatchRequest {
            credential,
            rate_limit_subject: principal.subject,
            rate_limit_cost: 1,
            required_permission: Some("tools:execute".to_string()),
            template: body.tool_id,
            method: "tools/call".to_string(),
            params: body.params,
            timeout: Duration::from_secs(30),
            strategy: Strategy::RoundRobin,
            retries_override: body.options.retries,
        })
        .await?;

    if reply.is_failure() {
        // A well-formed frame carrying a JSON-RPC `error` object is not a
        // malformed frame (that's `ProtocolError`) — it's the backend tool
        // rejecting the call. The closed error taxonomy has no dedicated
        // kind for that, so it surfaces as `Internal` (500, per §8
        // scenario 2).
        let message = reply
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| "backend returned an error frame".to_string());
        return Err(GatewayError::Internal(message).into());
    }

    Ok(Json(ExecuteToolResponse {
        success: true,
        result: reply.result.unwrap_or(Value::Null),
    }))
}

enum LogStreamState {
    Backfill(
        std::vec::IntoIter<gateway_bus::EventEnvelope<LogEntry>>,
        mpsc::UnboundedReceiver<LogEntry>,
        gateway_bus::Subscription<LogEntry>,
    ),
    Live(mpsc::UnboundedReceiver<LogEntry>, gateway_bus::Subscription<LogEntry>),
    Done,
}

/// `GET /api/logs/stream` — SSE. Drains the ring-buffer backfill first,
/// then forwards live entries, then emits one terminal `event: error`
/// before closing (§6, §7).
async fn stream_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    authenticate(&state, &headers, peer, None)?;

    let backfill = state.log_broadcaster.backfill().into_iter();
    let (tx, rx) = mpsc::unbounded_channel::<LogEntry>();
    let subscription = state.log_broadcaster.bus().subscribe(move |envelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(envelope.payload);
        }
    });

    let initial = LogStreamState::Backfill(backfill, rx, subscription);
    let stream = stream::unfold(initial, |phase| async move {
        match phase {
            LogStreamState::Backfill(mut iter, rx, sub) => match iter.next() {
                Some(envelope) => {
                    let event = Event::default()
                        .event("log")
                        .json_data(&envelope.payload)
                        .expect("LogEntry always serializes");
                    Some((Ok(event), LogStreamState::Backfill(iter, rx, sub)))
                }
                None => Some((
                    Ok(Event::default().comment("backfill complete")),
                    LogStreamState::Live(rx, sub),
                )),
            },
            LogStreamState::Live(mut rx, sub) => match rx.recv().await {
                Some(entry) => {
                    let event = Event::default()
                        .event("log")
                        .json_data(&entry)
                        .expect("LogEntry always serializes");
                    Some((Ok(event), LogStreamState::Live(rx, sub)))
                }
                None => Some((
                    Ok(Event::default().event("error").data("log stream closed")),
                    LogStreamState::Done,
                )),
            },
            LogStreamState::Done => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
