mod health;
mod metrics;
mod submit;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use submit::submit_handler;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/submit", post(submit_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
