use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
};
use prometheus::Registry;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug_span, info};
use ulid::Ulid;

mod handlers;
pub mod shutdown;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: Option<&str> = built_info::GIT_COMMIT_HASH;

/// Serve `/metrics` and the health endpoints until a shutdown signal.
///
/// `/metrics` renders the registry as-is; collection happens on the
/// scheduler's clock, never on an HTTP read.
///
/// # Errors
///
/// Returns an error when the port cannot be bound or the server fails.
pub async fn serve(
    port: u16,
    listen: Option<String>,
    pool: PgPool,
    registry: Registry,
) -> Result<()> {
    let app = router(pool, registry);

    let addr = listen.unwrap_or_else(|| "::".to_string());
    let listener = TcpListener::bind((addr.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {addr}:{port}"))?;

    info!(addr = %addr, port, "listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown::shutdown_signal_handler())
        .await?;

    Ok(())
}

/// The exporter's HTTP surface; separated from `serve` so tests can drive it
/// without binding a socket.
#[must_use]
pub fn router(pool: PgPool, registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health).options(handlers::health))
        .route(
            "/health/live",
            get(handlers::health).options(handlers::health),
        )
        .route("/health/ready", get(handlers::ready))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(pool))
                .layer(Extension(registry)),
        )
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let path = request.uri().path();
    let request_id = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, request_id)
}
