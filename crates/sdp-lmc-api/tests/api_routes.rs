//! Route tests: drive a device end to end through the router.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use sdp_config::ConfigDb;
use sdp_lmc::{LmcSettings, MasterDevice, SubarrayDevice};
use sdp_lmc_api::build_router;
use serde_json::{Value, json};
use tower::ServiceExt;

fn master_router() -> Router {
    let store = ConfigDb::open_in_memory().unwrap();
    let device =
        MasterDevice::new("test_sdp/elt/master", &LmcSettings::in_memory(true), store).unwrap();
    build_router(Arc::new(device))
}

fn subarray_router(event_loop: bool) -> Router {
    let store = ConfigDb::open_in_memory().unwrap();
    let device = SubarrayDevice::new(
        "test_sdp/elt/subarray_1",
        &LmcSettings::in_memory(event_loop),
        store,
    )
    .unwrap();
    build_router(Arc::new(device))
}

async fn send(router: &Router, method: &str, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn attribute(router: &Router, name: &str) -> Value {
    let (status, body) = send(router, "GET", &format!("/api/v1/attributes/{name}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    body["data"].clone()
}

#[tokio::test]
async fn device_info() {
    let router = master_router();
    let (status, body) = send(&router, "GET", "/api/v1/device", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["name"], json!("test_sdp/elt/master"));
    assert_eq!(body["data"]["kind"], json!("master"));
    assert_eq!(body["data"]["commands"], json!(["On", "Off", "Standby", "Disable"]));
}

#[tokio::test]
async fn list_attributes_in_order() {
    let router = subarray_router(true);
    let (status, body) = send(&router, "GET", "/api/v1/attributes", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        [
            "State",
            "version",
            "obsState",
            "adminMode",
            "healthState",
            "receiveAddresses",
            "scanType",
            "scanID"
        ]
    );
    assert_eq!(body["data"][2]["value"], json!("EMPTY"));
}

#[tokio::test]
async fn master_commands_change_state() {
    let router = master_router();
    assert_eq!(attribute(&router, "State").await, json!("STANDBY"));

    let (status, _) = send(&router, "POST", "/api/v1/commands/On", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attribute(&router, "State").await, json!("ON"));

    let (status, body) = send(&router, "POST", "/api/v1/commands/On", "").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["data"]["reason"], json!("API_CommandNotAllowed"));
    assert_eq!(body["data"]["origin"], json!("SDPMaster.is_On_allowed()"));
    assert_eq!(
        body["error"],
        json!("Command On not allowed when device state is ON")
    );
}

#[tokio::test]
async fn failed_command_is_bad_request() {
    let router = subarray_router(true);
    send(&router, "POST", "/api/v1/commands/On", "").await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/commands/Configure",
        json!({"scan_type": "science"}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], json!("Command Configure not allowed when obsState is EMPTY"));

    let (status, body) = send(&router, "POST", "/api/v1/commands/AssignResources", "{}").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["data"]["reason"], json!("API_CommandFailed"));
    assert_eq!(body["error"], json!("Configuration validation failed"));
}

#[tokio::test]
async fn unknown_command_and_attribute() {
    let router = master_router();
    let (status, _) = send(&router, "POST", "/api/v1/commands/Scan", "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, "GET", "/api/v1/attributes/scanID", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn write_admin_mode() {
    let router = subarray_router(true);
    let (status, body) = send(
        &router,
        "PUT",
        "/api/v1/attributes/adminMode",
        json!({"value": "OFFLINE"}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!("OFFLINE"));
    assert_eq!(attribute(&router, "adminMode").await, json!("OFFLINE"));

    let (status, _) = send(
        &router,
        "PUT",
        "/api/v1/attributes/State",
        json!({"value": "ON"}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn manual_update_attributes() {
    let router = subarray_router(false);
    assert_eq!(attribute(&router, "State").await, json!("INIT"));
    assert_eq!(attribute(&router, "obsState").await, Value::Null);

    let (status, _) = send(&router, "POST", "/api/v1/update_attributes", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attribute(&router, "State").await, json!("OFF"));
    assert_eq!(attribute(&router, "obsState").await, json!("EMPTY"));
}
