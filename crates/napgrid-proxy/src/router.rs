//! HTTP surface of napd.

use axum::Router;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::get;

use crate::handler::{FunctionProxy, proxy_middleware};

/// Build the full router: `/health`, a terminal 404, and the function
/// proxy layered in front of both.
pub fn build_router(proxy: FunctionProxy) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(proxy, proxy_middleware))
}

async fn health() -> &'static str {
    "OK"
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
