use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::{Value, json};

use conveyor_broker::{Broker, ResultStore};

use crate::app::services::AppServices;

pub async fn root(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let settings = services.settings();
    Json(json!({
        "message": settings.app_name,
        "version": env!("CARGO_PKG_VERSION"),
        "environment": settings.environment,
    }))
}

/// Liveness: the process is up and serving.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

/// Readiness: broker and result store both answer a ping.
pub async fn ready(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let (broker, store) = tokio::join!(services.broker().ping(), services.store().ping());
    let is_ready = broker.is_ok() && store.is_ok();

    if !is_ready {
        tracing::warn!(
            broker_ok = broker.is_ok(),
            store_ok = store.is_ok(),
            "readiness check failed"
        );
    }

    let status = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if is_ready { "ready" } else { "not_ready" },
            "broker": check(services.broker().name(), broker),
            "result_backend": check(services.store().name(), store),
        })),
    )
}

fn check<E: std::fmt::Display>(backend: &str, outcome: Result<(), E>) -> Value {
    match outcome {
        Ok(()) => json!({ "backend": backend, "status": "ok" }),
        Err(e) => json!({ "backend": backend, "status": "error", "error": e.to_string() }),
    }
}
