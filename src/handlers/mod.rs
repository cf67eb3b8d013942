pub mod command;
pub mod metrics;

use axum::{Router, routing::get};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::types::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/command",
            get(command::command_ws_handler).post(command::command_endpoint),
        )
        .route("/status", get(command::status_endpoint))
        .route("/metrics", get(metrics::metrics_endpoint))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}
