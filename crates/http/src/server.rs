use std::net::SocketAddr;
use std::sync::Arc;

use engine::RuntimeState;

use crate::router::app_router;

pub async fn serve_http(state: Arc<RuntimeState>) {
    let port = state.config.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = app_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    tracing::info!("Listening {} port", port);
    axum::serve(listener, app).await.unwrap();
}
