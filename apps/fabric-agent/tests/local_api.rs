use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use fabric_agent::agent::Agent;
use fabric_agent::config::AgentConfig;
use fabric_agent::routing::{RouteTableStore, RoutingTable};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn build_app(table: RoutingTable) -> Router {
    Agent::start(&AgentConfig::default(), RouteTableStore::new(table))
        .expect("agent start")
        .router()
}

async fn json_body(response: axum::response::Response) -> Result<Value, Box<dyn std::error::Error>> {
    let bytes = body::to_bytes(response.into_body(), 1024 * 64).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn post_json(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json; charset=utf-8")
        .body(Body::from(payload.to_string()))
        .expect("request")
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn log_submission_is_acknowledged() -> TestResult {
    let app = build_app(RoutingTable::new());
    let response = app
        .oneshot(post_json(
            "/v2/log",
            json!({"message": "sensor warming up", "type": "info", "id": "thermo-1"}),
        ))
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await?, json!({"status": "okay"}));
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn log_rejects_other_methods() -> TestResult {
    let app = build_app(RoutingTable::new());
    let response = app
        .oneshot(Request::builder().method("GET").uri("/v2/log").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn log_rejects_non_json_content() -> TestResult {
    let app = build_app(RoutingTable::new());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v2/log")
                .header("content-type", "text/plain")
                .body(Body::from("hello"))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = body::to_bytes(response.into_body(), 1024).await?;
    assert_eq!(&bytes[..], b" Incorrect content type ");
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn log_rejects_incomplete_payload() -> TestResult {
    let app = build_app(RoutingTable::new());
    let response = app
        .oneshot(post_json("/v2/log", json!({"message": "no id", "type": "info"})))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn published_message_can_be_polled_by_receiver() -> TestResult {
    let app = build_app(RoutingTable::new().with_route("camera", ["detector"]));

    let response = app
        .clone()
        .oneshot(post_json(
            "/v2/messages/new",
            json!({
                "publisher": "camera",
                "contenttype": "text/plain",
                "contentdata": STANDARD.encode("frame-1"),
            }),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let published = json_body(response).await?;
    assert_eq!(published["status"], "okay");
    let id = published["id"].as_str().expect("id").to_string();

    let response = app
        .clone()
        .oneshot(post_json("/v2/messages/next", json!({"id": "detector"})))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let drained = json_body(response).await?;
    assert_eq!(drained["count"], 1);
    assert_eq!(drained["messages"][0]["id"], id.as_str());
    assert_eq!(drained["messages"][0]["publisher"], "camera");
    assert_eq!(drained["messages"][0]["contentdata"], STANDARD.encode("frame-1"));

    let response = app
        .oneshot(post_json("/v2/messages/next", json!({"id": "detector"})))
        .await?;
    assert_eq!(json_body(response).await?["count"], 0);
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn publishing_without_route_is_a_client_error() -> TestResult {
    let app = build_app(RoutingTable::new().with_route("camera", ["detector"]));
    let response = app
        .oneshot(post_json(
            "/v2/messages/new",
            json!({"publisher": "detector", "contentdata": ""}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn routes_update_reconciles_bus() -> TestResult {
    let app = build_app(RoutingTable::new().with_route("camera", ["detector"]));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v2/routes")
                .header("content-type", "application/json")
                .body(Body::from(json!({"gps": ["map"], "camera": []}).to_string()))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["publishers"], json!(["gps"]));
    assert_eq!(body["receivers"], json!(["map"]));

    let response = app
        .clone()
        .oneshot(post_json(
            "/v2/messages/new",
            json!({"publisher": "camera", "contentdata": ""}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(Request::builder().uri("/v2/status").body(Body::empty())?)
        .await?;
    let status = json_body(response).await?;
    assert_eq!(status["published_per_element"], json!({"gps": 0, "map": 0}));
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn status_reports_processed_messages() -> TestResult {
    let app = build_app(RoutingTable::new().with_route("camera", ["detector"]));
    app.clone()
        .oneshot(post_json(
            "/v2/messages/new",
            json!({"publisher": "camera", "contentdata": "AA=="}),
        ))
        .await?;

    let response = app
        .oneshot(Request::builder().uri("/v2/status").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let status = json_body(response).await?;
    assert_eq!(status["processed_messages"], 1);
    assert_eq!(status["published_per_element"]["camera"], 1);
    assert_eq!(status["open_realtime_sessions"], 0);
    Ok(())
}
