use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::gate::Gate;
use crate::queue::JobQueue;
use crate::routes;
use crate::store::ReviewStore;

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<Gate>,
    pub store: Arc<dyn ReviewStore>,
    pub queue: Arc<dyn JobQueue>,
    pub webhook_secret: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(routes::webhook::webhook_handler))
        .route("/health", get(routes::health::health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
