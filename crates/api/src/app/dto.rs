use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use conveyor_core::TaskId;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct SendEmailRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct ProcessDataRequest {
    pub data: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct SetValueQuery {
    pub value: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct TaskQueuedResponse {
    pub task_id: String,
    pub status: &'static str,
    pub message: String,
}

impl TaskQueuedResponse {
    pub fn new(task_id: TaskId, what: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: "queued",
            message: format!("{what} task queued with ID: {task_id}"),
        }
    }
}
