use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use conveyor_broker::{BrokerError, StoreError};
use conveyor_core::TaskError;

pub fn task_error_to_response(err: TaskError) -> axum::response::Response {
    match err {
        TaskError::UnknownTask(name) => json_error(
            StatusCode::BAD_REQUEST,
            "unknown_task",
            format!("unknown task: {name}"),
        ),
        TaskError::Serialization(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "serialization_error", msg)
        }
        TaskError::InvalidIdentifier(msg) => json_error(
            StatusCode::BAD_REQUEST,
            "invalid_task_id",
            format!("Invalid task ID: {msg}"),
        ),
        TaskError::StoreUnavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        TaskError::BrokerUnavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", msg)
        }
        // Handler failures are recorded on the task, never returned to a caller.
        TaskError::Handler(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        StoreError::Config(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_config", msg)
        }
    }
}

pub fn broker_error_to_response(err: BrokerError) -> axum::response::Response {
    match err {
        BrokerError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", msg)
        }
        BrokerError::UnknownDelivery(id) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unknown_delivery",
            format!("unknown delivery: {id}"),
        ),
        BrokerError::Config(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "broker_config", msg)
        }
        BrokerError::StoreUnavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
