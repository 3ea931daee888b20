use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::bridge::BridgeError;
use crate::dispatch::{FailureStage, OperationFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Execution,
    Infra,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(
        kind: ErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            details,
        }
    }
}

/// HTTP status and envelope error for a bridge error. Internal errors are
/// mapped by the caller so their detail can be logged and withheld.
pub fn classify_bridge_error(error: &BridgeError) -> Option<(StatusCode, ApiError)> {
    match error {
        BridgeError::UnknownOperation(name) => Some((
            StatusCode::NOT_FOUND,
            ApiError::new(
                ErrorKind::Validation,
                "unknown_operation",
                format!("Unknown operation '{name}'"),
                None,
            ),
        )),
        BridgeError::InvalidArguments { operation, message } => Some((
            StatusCode::BAD_REQUEST,
            ApiError::new(
                ErrorKind::Validation,
                "invalid_arguments",
                message.clone(),
                Some(json!({ "operation": operation })),
            ),
        )),
        BridgeError::Failed(failure) => Some(classify_failure(failure)),
        BridgeError::Internal(_) => None,
    }
}

pub fn classify_failure(failure: &OperationFailure) -> (StatusCode, ApiError) {
    let (status, kind) = match failure.stage {
        FailureStage::Cancelled => (StatusCode::CONFLICT, ErrorKind::Execution),
        stage if stage.is_remote() => (StatusCode::BAD_GATEWAY, ErrorKind::Infra),
        _ => (StatusCode::UNPROCESSABLE_ENTITY, ErrorKind::Execution),
    };
    (
        status,
        ApiError::new(
            kind,
            failure.stage.as_str(),
            failure.message.clone(),
            failure_details(failure),
        ),
    )
}

fn failure_details(failure: &OperationFailure) -> Option<Value> {
    let mut details = Map::new();
    if let Some(code) = failure.exit_code {
        details.insert(String::from("exit_code"), json!(code));
    }
    if let Some(status) = failure.http_status {
        details.insert(String::from("http_status"), json!(status));
    }
    if let Some(remote) = failure.remote_attempt.as_deref() {
        details.insert(
            String::from("remote_attempt"),
            serde_json::to_value(remote).unwrap_or(Value::Null),
        );
    }
    (!details.is_empty()).then_some(Value::Object(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn execution_failures_carry_exit_code_and_remote_attempt() {
        let failure = OperationFailure::execution(2, "Traceback: boom")
            .with_remote_attempt(OperationFailure::remote_status(400, "bad size"));
        let (status, error) = classify_failure(&failure);

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error.kind, ErrorKind::Execution);
        assert_eq!(error.code, "execution");
        assert_eq!(
            error.details,
            Some(json!({
                "exit_code": 2,
                "remote_attempt": {
                    "stage": "remote-status",
                    "message": "bad size",
                    "http_status": 400
                }
            }))
        );
    }

    #[test]
    fn cancellation_and_remote_failures_map_to_distinct_statuses() {
        let (status, error) = classify_failure(&OperationFailure::cancelled());
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error.code, "cancelled");
        assert_eq!(error.details, None);

        let (status, error) = classify_failure(&OperationFailure::remote_transport("refused"));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(error.kind, ErrorKind::Infra);
    }

    #[test]
    fn bridge_validation_errors_are_client_errors() {
        let (status, error) =
            classify_bridge_error(&BridgeError::UnknownOperation(String::from("format")))
                .expect("unknown operation is classified");
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error.code, "unknown_operation");

        let (status, error) = classify_bridge_error(&BridgeError::InvalidArguments {
            operation: "resizeImage",
            message: String::from("width is required"),
        })
        .expect("invalid arguments are classified");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.message, "width is required");

        assert!(classify_bridge_error(&BridgeError::Internal(String::from("x"))).is_none());
    }
}
