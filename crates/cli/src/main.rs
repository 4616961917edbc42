use std::sync::Arc;

use engine::{RuntimeConfig, RuntimeState};

fn main() {
    tracing_subscriber::fmt::init();

    let config = RuntimeConfig::from_env();
    tracing::info!(
        "Starting call service: {} workers, gql {}",
        config.workers,
        config.gql_path
    );

    let state = Arc::new(RuntimeState::new(config));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");
    rt.block_on(http::serve_http(state));
}
