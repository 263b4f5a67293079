use axum::{
    body::Bytes,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::routes::require_json_post;

#[derive(Debug, Deserialize)]
pub struct LogRequest {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

/// Records a log line on behalf of an element.
pub async fn log_handler(method: Method, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(rejection) = require_json_post(&method, &headers) {
        return rejection;
    }

    let request: LogRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let detail = format!(" Log message parsing error, {err}");
            warn!(error = %err, "log message parsing error");
            return (StatusCode::BAD_REQUEST, detail).into_response();
        }
    };

    record_element_log(&request);
    Json(json!({ "status": "okay" })).into_response()
}

pub fn record_element_log(request: &LogRequest) {
    if request.kind == "info" {
        info!(target: "element", element_id = %request.id, "{}", request.message);
    } else {
        warn!(target: "element", element_id = %request.id, "{}", request.message);
    }
}
