use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use metrics::gauge;

use crate::dispatcher::DispatcherState;
use crate::types::AppState;

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Renders the Prometheus text exposition, with the scheduler flags sampled at scrape time.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = &state.dispatcher;
    let processing = dispatcher.state() == DispatcherState::Processing;
    gauge!("dispatcher_processing").set(if processing { 1.0 } else { 0.0 });

    let status = dispatcher.supervisor().status();
    gauge!("program_running").set(if status.running { 1.0 } else { 0.0 });
    let pending = dispatcher.supervisor().events().len();
    gauge!("data_ready").set(if pending > 0 { 1.0 } else { 0.0 });

    state.prometheus_handle.run_upkeep();
    ([(CONTENT_TYPE, PROMETHEUS_TEXT)], state.prometheus_handle.render())
}
