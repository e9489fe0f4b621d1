//! Localhost-only request guard.
//!
//! The worker binds to 127.0.0.1, but the guard also rejects any request
//! whose peer address is not loopback - defense against unexpected binds
//! and forwarded sockets. Non-loopback peers get a 403.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub async fn require_loopback(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if !addr.ip().is_loopback() {
        tracing::warn!(peer = %addr, "rejected non-loopback request");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "loopback connections only" })),
        )
            .into_response();
    }
    next.run(request).await
}
