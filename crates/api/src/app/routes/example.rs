use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::dto::{ProcessDataRequest, SendEmailRequest, TaskQueuedResponse};
use crate::app::services::AppServices;
use crate::app::{errors, tasks};

pub fn router() -> Router {
    Router::new()
        .route("/send-email", post(send_email))
        .route("/process-data", post(process_data))
        .route("/task/:task_id", get(task_status))
}

pub async fn send_email(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SendEmailRequest>,
) -> axum::response::Response {
    if !tasks::is_valid_email(&body.to) {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_email",
            format!("invalid email address: {}", body.to),
        );
    }

    match services.client().submit_kwargs(tasks::SEND_EMAIL, &body).await {
        Ok(task_id) => Json(TaskQueuedResponse::new(task_id, "Email")).into_response(),
        Err(e) => errors::task_error_to_response(e),
    }
}

pub async fn process_data(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<ProcessDataRequest>,
) -> axum::response::Response {
    let kwargs = serde_json::json!({ "data": body.data });
    match services.client().submit_kwargs(tasks::PROCESS_DATA, &kwargs).await {
        Ok(task_id) => {
            Json(TaskQueuedResponse::new(task_id, "Data processing")).into_response()
        }
        Err(e) => errors::task_error_to_response(e),
    }
}

pub async fn task_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(task_id): Path<String>,
) -> axum::response::Response {
    match services.client().status(&task_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::task_error_to_response(e),
    }
}
