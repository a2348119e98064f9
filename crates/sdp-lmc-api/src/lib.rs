//! sdp-lmc-api: REST API for an SDP LMC device.
//!
//! Exposes one device's attributes and commands over HTTP. Every response
//! uses the `{success, data?, error?}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/device` | Device name, kind, version and commands |
//! | GET | `/api/v1/attributes` | All published attributes |
//! | GET | `/api/v1/attributes/:name` | One attribute |
//! | PUT | `/api/v1/attributes/:name` | Write a writable attribute |
//! | POST | `/api/v1/commands/:name` | Invoke a command; the body is its JSON argument |
//! | POST | `/api/v1/update_attributes` | Run one reconciliation pass |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use sdp_lmc::Device;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub device: Arc<dyn Device>,
}

/// Build the API router for `device`.
pub fn build_router(device: Arc<dyn Device>) -> Router {
    let api_routes = Router::new()
        .route("/device", get(handlers::get_device))
        .route("/attributes", get(handlers::list_attributes))
        .route(
            "/attributes/{name}",
            get(handlers::get_attribute).put(handlers::write_attribute),
        )
        .route("/commands/{name}", post(handlers::run_command))
        .route("/update_attributes", post(handlers::update_attributes))
        .with_state(ApiState { device });

    Router::new().nest("/api/v1", api_routes)
}
