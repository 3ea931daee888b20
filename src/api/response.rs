use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::api::error::{classify_bridge_error, ApiError, ErrorKind};
use crate::bridge::BridgeError;

/// `{ok, data}` on success, `{ok, error}` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiEnvelope<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

pub type ApiJson<T> = (StatusCode, Json<ApiEnvelope<T>>);

pub fn success<T>(payload: T) -> ApiJson<Value>
where
    T: Serialize,
{
    match serde_json::to_value(payload) {
        Ok(data) => (
            StatusCode::OK,
            Json(ApiEnvelope {
                ok: true,
                data: Some(data),
                error: None,
            }),
        ),
        Err(e) => internal_error(format!("response serialization failed: {e}")),
    }
}

pub fn failure(status: StatusCode, error: ApiError) -> ApiJson<Value> {
    (
        status,
        Json(ApiEnvelope {
            ok: false,
            data: None,
            error: Some(error),
        }),
    )
}

pub fn bridge_failure(error: BridgeError) -> ApiJson<Value> {
    match classify_bridge_error(&error) {
        Some((status, api_error)) => failure(status, api_error),
        None => internal_error(error.to_string()),
    }
}

pub fn internal_error(message: impl Into<String>) -> ApiJson<Value> {
    let detail = message.into();
    error!(detail = %detail, "internal api error");
    failure(
        StatusCode::INTERNAL_SERVER_ERROR,
        ApiError::new(
            ErrorKind::Infra,
            "internal_error",
            "Internal server error",
            None,
        ),
    )
}
