use std::sync::Arc;

use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod http;
pub mod logging;
pub mod registry;
pub mod rpc;
pub mod subprocess;

use registry::{PendingRegistry, SessionRegistry};
use subprocess::FrameSink;

#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<dyn FrameSink>,
    pub sessions: Arc<SessionRegistry>,
    pub pending: Arc<PendingRegistry>,
}

impl AppState {
    pub fn new(
        sink: Arc<dyn FrameSink>,
        sessions: Arc<SessionRegistry>,
        pending: Arc<PendingRegistry>,
    ) -> Self {
        Self {
            sink,
            sessions,
            pending,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/sse", get(http::handlers::sse))
        .route("/messages", post(http::handlers::messages))
        .layer(cors)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
