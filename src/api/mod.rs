use axum::{routing::post, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::inference::Summarizer;

pub mod handlers;
pub mod types;

#[derive(Clone)]
pub struct AppState {
    pub summarizer: Arc<dyn Summarizer>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/summarize", post(handlers::summarize))
}

/// Full application: routes, CORS for any origin, request tracing.
pub fn app(state: AppState) -> Router {
    router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
