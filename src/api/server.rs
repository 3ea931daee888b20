use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::operations::{
    invoke_operation_handler, list_operations_handler, remote_ping_handler,
};
use crate::bridge::OperationBridge;
use crate::config::DispatchSettings;
use crate::dispatch::registry::RegistryError;
use crate::dispatch::{OperationCommandRunner, StdOperationCommandRunner};

pub struct AppState<R> {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub bridge: OperationBridge<R>,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            service_name: self.service_name,
            service_version: self.service_version,
            started_unix_ms: self.started_unix_ms,
            bridge: self.bridge.clone(),
        }
    }
}

impl<R> AppState<R>
where
    R: OperationCommandRunner,
{
    pub fn new(bridge: OperationBridge<R>) -> Self {
        Self {
            service_name: "imgpop-backend-core",
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            bridge,
        }
    }
}

pub fn build_router(settings: &DispatchSettings) -> Result<Router, RegistryError> {
    let bridge = OperationBridge::<StdOperationCommandRunner>::from_settings(settings)?;
    Ok(build_router_with_bridge(bridge))
}

pub fn build_router_with_bridge<R>(bridge: OperationBridge<R>) -> Router
where
    R: OperationCommandRunner,
{
    Router::new()
        .route("/health", get(health_handler::<R>))
        .route("/api/remote/ping", get(remote_ping_handler::<R>))
        .route("/api/operations", get(list_operations_handler::<R>))
        .route("/api/operations/{name}", post(invoke_operation_handler::<R>))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(bridge))
}

pub async fn serve(settings: DispatchSettings) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = settings.bind;
    let app = build_router(&settings)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        bind = %addr,
        remote = settings.remote_base_url.as_ref().map(|url| url.as_str()).unwrap_or("disabled"),
        tools_dir = %settings.tools_dir.display(),
        "starting imgpop-backend-core HTTP surface"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler<R>(State(state): State<AppState<R>>) -> (StatusCode, Json<serde_json::Value>)
where
    R: OperationCommandRunner,
{
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": "ok",
            "service": state.service_name,
            "version": state.service_version,
            "started_unix_ms": state.started_unix_ms,
            "remote_configured": state.bridge.dispatcher().remote().is_some(),
        })),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
