use std::path::PathBuf;
use std::sync::Arc;

use config::Config;
use dotenvy::dotenv;
use edu_scheduler::{
    build_dispatcher,
    clock::SystemClock,
    handlers::router,
    system_monitor,
    types::{AppConfig, AppState},
};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    dotenv().ok();
    let settings = Config::builder()
        .add_source(config::File::with_name("Settings").required(false))
        .add_source(config::Environment::with_prefix("APP"))
        .build()
        .expect("failed to load settings");

    let app_config: AppConfig = settings
        .try_deserialize()
        .expect("invalid scheduler configuration");

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder");

    describe_counter!("commands_total", "Total number of dispatched commands");
    describe_histogram!("command_duration_ms", "Command processing time in milliseconds");
    describe_counter!("executions_total", "Total number of program runs by outcome");
    describe_histogram!(
        "execution_wall_time_ms",
        "Wall time of a program run in milliseconds"
    );
    describe_gauge!("program_running", "Whether a program is currently running");
    describe_gauge!("data_ready", "Whether finished runs are waiting to be reported");
    describe_gauge!("dispatcher_processing", "Whether a command is being processed");
    describe_counter!("archives_stored_total", "Total number of stored archives");
    describe_counter!("results_collected_total", "Total number of collected result bundles");
    describe_gauge!(
        "websocket_connections_active",
        "Number of active websocket connections"
    );
    describe_counter!(
        "websocket_messages_received_total",
        "Total number of websocket messages received"
    );
    describe_counter!(
        "websocket_messages_sent_total",
        "Total number of websocket messages sent"
    );
    describe_gauge!("system_memory_used_bytes", "Used system memory in bytes");
    describe_gauge!("system_memory_total_bytes", "Total system memory in bytes");
    describe_gauge!("system_cpu_usage_percent", "System CPU usage in percent");
    describe_gauge!("system_disk_free_bytes", "Free space on the data disk in bytes");
    describe_gauge!("system_disk_total_bytes", "Total space on the data disk in bytes");

    let dispatcher = build_dispatcher(
        &app_config,
        SystemClock::new(app_config.update_system_time),
    )
    .expect("failed to prepare archive and data directories");
    let dispatcher = Arc::new(dispatcher);

    system_monitor::start_system_monitor(PathBuf::from(&app_config.data_path)).await;

    let app = router(AppState {
        dispatcher: dispatcher.clone(),
        prometheus_handle: handle,
    });

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", app_config.port))
        .await
        .expect("failed to bind listener");

    tracing::info!(
        "scheduler listening on {}",
        listener.local_addr().expect("listener has no address")
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .expect("server error");

    if dispatcher.supervisor().stop().await.is_ok() {
        tracing::info!("stopped running program before exit");
    }
}
