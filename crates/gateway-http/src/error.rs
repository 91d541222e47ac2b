use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::GatewayError;
use serde::Serialize;
use serde_json::{json, Value};

/// The uniform error envelope (§6): `{ success: false, error: { message,
/// code, recoverable, meta } }`. Every fallible handler returns
/// `Result<T, ApiError>` and lets this conversion do the rest.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: String,
    code: &'a str,
    recoverable: bool,
    meta: Value,
}

/// HTTP status mapping from SPEC_FULL.md §7.
fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::ConnectError { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::ProtocolError { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn meta_for(err: &GatewayError) -> Value {
    match err {
        GatewayError::RateLimited { retry_after_ms } => json!({ "retryAfterMs": retry_after_ms }),
        GatewayError::NoHealthyInstance { template } => json!({ "template": template }),
        GatewayError::BreakerOpen { instance_id } | GatewayError::QueueFull { instance_id } => {
            json!({ "instanceId": instance_id })
        }
        GatewayError::ConnectError { instance_id, .. } => json!({ "instanceId": instance_id }),
        _ => Value::Null,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                message: self.0.to_string(),
                code: self.0.code(),
                recoverable: self.0.recoverable(),
                meta: meta_for(&self.0),
            },
        };
        (status, Json(body)).into_response()
    }
}
