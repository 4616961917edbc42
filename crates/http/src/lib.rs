//! HTTP surface: the axum router for the call endpoints and the server
//! bootstrap.

mod router;
mod server;

pub use router::app_router;
pub use server::serve_http;
