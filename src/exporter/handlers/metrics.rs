use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{error, instrument};

/// Render the current registry snapshot.
///
/// Strictly read-through: no collector runs on behalf of this handler, so an
/// HTTP read can never pile load onto a struggling database.
#[instrument(skip(registry), fields(http.route = "/metrics"))]
pub async fn metrics(Extension(registry): Extension<Registry>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, headers, body),
            Err(e) => {
                error!("metric exposition was not valid UTF-8: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    headers,
                    "encoding error".to_string(),
                )
            }
        },
        Err(e) => {
            error!("failed to encode metrics: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("failed to encode metrics: {e}"),
            )
        }
    }
}
