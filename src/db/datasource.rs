//! Connection pool construction.
//!
//! The coordinator pool is sized from the settings; per-database pools are
//! derived from the base DSN by swapping the database path segment, hold a
//! single connection, and recycle it quickly so a cluster restart does not
//! leave stale connections behind.

use crate::config::{PoolSettings, Settings};
use anyhow::{Context, Result, bail};
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Per-database pools are throwaway by design; keep their connections short-lived.
pub const PER_DB_MAX_LIFETIME: Duration = Duration::from_secs(2 * 60);

const MAX_DATABASE_NAME_BYTES: usize = 63;

/// Conservative database-name validator.
///
/// Deliberately stricter than the server's identifier rules: anything outside
/// `[A-Za-z0-9_-]` is rejected, which also covers `;`, quotes and `--`.
///
/// # Errors
///
/// Returns an error for empty, oversized, or suspicious names; callers treat
/// it as a failed datasource creation.
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("database name is empty");
    }
    if name.len() > MAX_DATABASE_NAME_BYTES {
        bail!("database name exceeds {MAX_DATABASE_NAME_BYTES} bytes");
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        bail!("database name contains forbidden character {bad:?}");
    }
    Ok(())
}

/// Build the coordinator pool from the settings.
///
/// # Errors
///
/// Returns an error when the DSN is malformed or the initial connection fails.
pub async fn primary_pool(settings: &Settings) -> Result<PgPool> {
    let opts = base_options(&settings.dsn)?;

    pool_options(&settings.pool)
        .connect_with(opts)
        .await
        .context("failed to connect to the coordinator database")
}

/// Build a single-connection pool bound to database `name`, derived from the
/// base DSN.
///
/// # Errors
///
/// Returns an error for an invalid database name, a malformed base DSN, or a
/// failed connection attempt.
pub async fn per_db_pool(dsn: &SecretString, name: &str) -> Result<PgPool> {
    let opts = options_for_database(dsn, name)?;

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(5))
        .max_lifetime(PER_DB_MAX_LIFETIME)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to connect to database {name:?}"))?;

    debug!(database = name, "created per-database pool");
    Ok(pool)
}

/// Connect options for database `name`, rewriting the path segment of the
/// base DSN.
///
/// # Errors
///
/// Returns an error when the name fails validation or the DSN is malformed.
pub fn options_for_database(dsn: &SecretString, name: &str) -> Result<PgConnectOptions> {
    validate_database_name(name)?;
    Ok(base_options(dsn)?.database(name))
}

fn base_options(dsn: &SecretString) -> Result<PgConnectOptions> {
    PgConnectOptions::from_str(dsn.expose_secret()).context("malformed database DSN")
}

fn pool_options(settings: &PoolSettings) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquisition_timeout)
        .max_lifetime(settings.max_lifetime)
        .test_before_acquire(true)
}
