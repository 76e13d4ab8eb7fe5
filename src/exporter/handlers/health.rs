use crate::exporter::GIT_COMMIT_HASH;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use tracing::{debug, error, instrument};

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
    name: String,
    version: String,
    database: String,
    checked_at: String,
}

// Liveness: ping the coordinator over a pooled connection.
#[instrument(skip(pool), err, fields(db.operation = "ping"))]
async fn check_database_health(pool: &PgPool) -> Result<(), StatusCode> {
    let mut conn = pool.acquire().await.map_err(|error| {
        error!(%error, "failed to acquire database connection");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    conn.ping().await.map_err(|error| {
        error!(%error, "failed to ping database");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

fn create_health_response(db_result: &Result<(), StatusCode>) -> Health {
    Health {
        commit: GIT_COMMIT_HASH.map(ToString::to_string),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if db_result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
        checked_at: chrono::Utc::now().to_rfc3339(),
    }
}

// GET gets a JSON body, OPTIONS gets headers only.
fn create_response_body(method: &Method, health: &Health) -> Body {
    if method == Method::GET {
        Json(health).into_response().into_body()
    } else {
        Body::empty()
    }
}

fn create_app_headers(health: &Health) -> HeaderMap {
    let short_hash = health
        .commit
        .as_deref()
        .filter(|s| s.len() > 7)
        .map(|s| s.chars().take(7).collect::<String>())
        .unwrap_or_default();

    let header_value = if short_hash.is_empty() {
        format!("{}:{}", health.name, health.version)
    } else {
        format!("{}:{}:{}", health.name, health.version, short_hash)
    };

    match header_value.parse::<HeaderValue>() {
        Ok(x_app) => {
            let mut headers = HeaderMap::new();
            headers.insert("X-App", x_app);
            headers
        }
        Err(err) => {
            debug!("failed to build X-App header: {err}");
            HeaderMap::new()
        }
    }
}

/// `/health` and `/health/live`.
#[instrument(skip(pool), fields(http.route = "/health"))]
pub async fn health(method: Method, pool: Extension<PgPool>) -> impl IntoResponse {
    let db_result = check_database_health(&pool.0).await;
    let health = create_health_response(&db_result);
    let body = create_response_body(&method, &health);
    let headers = create_app_headers(&health);

    match db_result {
        Ok(()) => (StatusCode::OK, headers, body),
        Err(status_code) => (status_code, headers, body),
    }
}

/// `/health/ready`: the process is up and serving; no database round trip.
#[instrument(fields(http.route = "/health/ready"))]
pub async fn ready() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ready" })),
    )
}
