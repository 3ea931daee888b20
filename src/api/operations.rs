use axum::body::Bytes;
use axum::extract::{Path, State};
use serde::Serialize;
use serde_json::{json, Value};

use crate::api::response::{bridge_failure, success, ApiJson};
use crate::api::server::AppState;
use crate::bridge::{BridgeError, BridgeOperation};
use crate::dispatch::OperationCommandRunner;

#[derive(Debug, Serialize)]
struct OperationCatalogEntry {
    name: &'static str,
    operation: &'static str,
    policy: &'static str,
}

pub async fn list_operations_handler<R>(State(state): State<AppState<R>>) -> ApiJson<Value>
where
    R: OperationCommandRunner,
{
    let registry = state.bridge.dispatcher().registry();
    let operations = BridgeOperation::ALL
        .into_iter()
        .filter_map(|op| {
            registry.get(op.operation()).map(|spec| OperationCatalogEntry {
                name: op.as_str(),
                operation: op.operation().as_str(),
                policy: spec.policy.as_str(),
            })
        })
        .collect::<Vec<_>>();
    success(json!({
        "count": operations.len(),
        "operations": operations,
    }))
}

pub async fn invoke_operation_handler<R>(
    State(state): State<AppState<R>>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiJson<Value>
where
    R: OperationCommandRunner,
{
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(body.as_ref()) {
            Ok(value) => value,
            Err(e) => {
                return bridge_failure(match BridgeOperation::parse(name.as_str()) {
                    Some(op) => BridgeError::InvalidArguments {
                        operation: op.as_str(),
                        message: format!("request body is not valid JSON: {e}"),
                    },
                    None => BridgeError::UnknownOperation(name),
                })
            }
        }
    };

    match state.bridge.invoke(name.as_str(), params).await {
        Ok(result) => success(result),
        Err(error) => bridge_failure(error),
    }
}

pub async fn remote_ping_handler<R>(State(state): State<AppState<R>>) -> ApiJson<Value>
where
    R: OperationCommandRunner,
{
    match state.bridge.ping().await {
        Ok(message) => success(json!({ "message": message })),
        Err(error) => bridge_failure(error),
    }
}
