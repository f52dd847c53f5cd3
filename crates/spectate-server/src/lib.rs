pub mod api;
pub mod config;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use libspectate::Broker;
use tokio_util::sync::CancellationToken;

pub use config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    /// Fired on shutdown so long-lived event streams close.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(broker: Broker, shutdown: CancellationToken) -> Self {
        Self { broker, shutdown }
    }
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/health", get(api::health))
        .route("/api/status", get(api::status))
        .route(
            "/api/workloads",
            get(api::list_workloads).post(api::register_workload),
        )
        .route("/api/workloads/{id}", get(api::get_workload))
        .route("/api/workloads/{id}/heartbeat", post(api::workload_heartbeat))
        .route("/api/workloads/{id}/watch", post(api::request_watch))
        .route("/api/leases/{id}", axum::routing::delete(api::release_lease))
        .route("/api/leases/{id}/heartbeat", post(api::lease_heartbeat))
        .route("/api/slots", get(api::list_slots).post(api::register_slot))
        .route("/api/slots/{id}", get(api::get_slot))
        .route("/api/slots/{id}/status", post(api::slot_status))
        .route("/api/slots/{id}/ready", post(api::slot_ready))
        .route("/api/slots/{id}/error", post(api::slot_error))
        .route("/ws/events", get(ws::events))
        .layer(cors)
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(methods)
        .allow_headers(Any))
}
