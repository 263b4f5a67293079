use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post, put},
    Json, Router,
};
use fabric_broker::BrokerError;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bus::BusError;
use crate::gateway::socket::socket_handler;
use crate::log_api::log_handler;
use crate::message::Message;
use crate::routing::{RouteSource, RoutingTable};
use crate::state::AppState;
use crate::status::StatusSnapshot;

const INCORRECT_CONTENT_TYPE: &str = " Incorrect content type ";

/// Local API endpoints accept only JSON bodies sent with POST.
pub(crate) fn require_json_post(method: &Method, headers: &HeaderMap) -> Result<(), Response> {
    if method != Method::POST {
        warn!(%method, "request method not allowed");
        return Err(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false);
    if !is_json {
        warn!("incorrect content type");
        return Err((StatusCode::BAD_REQUEST, INCORRECT_CONTENT_TYPE).into_response());
    }
    Ok(())
}

fn parse_json<T: DeserializeOwned>(
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, Response> {
    require_json_post(method, headers)?;
    serde_json::from_slice(body).map_err(|err| {
        warn!(error = %err, "invalid request body");
        (StatusCode::BAD_REQUEST, format!(" Invalid request body, {err}")).into_response()
    })
}

fn bus_error_response(err: BusError) -> Response {
    let status = match &err {
        BusError::NoPublisher(_) | BusError::NoReceiver(_) | BusError::Codec(_) => {
            StatusCode::BAD_REQUEST
        }
        BusError::Broker(BrokerError::NotRunning | BrokerError::MemoryLimit { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BusError::Broker(BrokerError::ChannelClosed(_)) => StatusCode::SERVICE_UNAVAILABLE,
    };
    warn!(error = %err, "message bus request failed");
    (status, Json(json!({ "status": "error", "error": err.to_string() }))).into_response()
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    open_sockets: usize,
    #[serde(flatten)]
    status: StatusSnapshot,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        uptime_secs: state.uptime_secs(),
        open_sockets: state.gateway().session_count(),
        status: state.status().snapshot(),
    })
}

#[derive(Serialize)]
struct PublishResponse {
    status: &'static str,
    id: String,
    timestamp: i64,
}

async fn publish_message(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message: Message = match parse_json(&method, &headers, &body) {
        Ok(message) => message,
        Err(rejection) => return rejection,
    };
    match state.bus().publish(message) {
        Ok(published) => Json(PublishResponse {
            status: "okay",
            id: published.id,
            timestamp: published.timestamp,
        })
        .into_response(),
        Err(err) => bus_error_response(err),
    }
}

#[derive(Deserialize)]
struct NextMessagesRequest {
    id: String,
}

#[derive(Serialize)]
struct NextMessagesResponse {
    status: &'static str,
    count: usize,
    messages: Vec<Message>,
}

async fn next_messages(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: NextMessagesRequest = match parse_json(&method, &headers, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    let drained = state
        .bus()
        .get_receiver(&request.id)
        .ok_or_else(|| BusError::NoReceiver(request.id.clone()))
        .and_then(|receiver| receiver.get_messages(usize::MAX));
    match drained {
        Ok(messages) => Json(NextMessagesResponse {
            status: "okay",
            count: messages.len(),
            messages,
        })
        .into_response(),
        Err(err) => bus_error_response(err),
    }
}

async fn replace_routes(
    State(state): State<AppState>,
    Json(table): Json<RoutingTable>,
) -> Json<serde_json::Value> {
    state.routes().replace(table);
    state.bus().update();
    let routes = state.routes().routes();
    info!(publishers = routes.publishers().len(), "routing table replaced");
    Json(json!({
        "status": "okay",
        "publishers": routes.publishers(),
        "receivers": routes.receivers(),
    }))
}

#[derive(Deserialize)]
struct InstanceConfigRequest {
    memory_limit_mb: usize,
}

async fn update_instance_config(
    State(state): State<AppState>,
    Json(request): Json<InstanceConfigRequest>,
) -> Json<serde_json::Value> {
    state
        .bus()
        .instance_config_updated(request.memory_limit_mb.saturating_mul(1024 * 1024));
    Json(json!({ "status": "okay" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/v2/status", get(status))
        .route("/v2/log", any(log_handler))
        .route("/v2/message/socket/*rest", get(socket_handler))
        .route("/v2/messages/new", any(publish_message))
        .route("/v2/messages/next", any(next_messages))
        .route("/v2/routes", put(replace_routes))
        .route("/v2/config/instance", post(update_instance_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
