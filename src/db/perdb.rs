//! Per-database connection provider.
//!
//! Enumerates the connectable, non-template databases from the coordinator,
//! filters them by the configured mode, and hands out one pool per allowed
//! database. Pools are either cached for the process lifetime or created per
//! scrape and closed in `cleanup()`.

use crate::config::{PerDbMode, PerDbSettings};
use crate::db::datasource;
use anyhow::Result;
use secrecy::SecretString;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Hands out per-database pools for one scrape and owns their lifecycle.
pub struct DatabaseProvider {
    dsn: SecretString,
    settings: PerDbSettings,
    /// Process-lifetime pools, populated on first use per database name.
    cached: Mutex<HashMap<String, PgPool>>,
    /// Pools created for the current scrape when caching is disabled;
    /// drained by `cleanup()`.
    temporary: Mutex<Vec<PgPool>>,
}

impl DatabaseProvider {
    #[must_use]
    pub fn new(dsn: SecretString, settings: PerDbSettings) -> Self {
        Self {
            dsn,
            settings,
            cached: Mutex::new(HashMap::new()),
            temporary: Mutex::new(Vec::new()),
        }
    }

    /// Pools for every allowed database, in enumeration order.
    ///
    /// Failures are soft: a database whose pool cannot be built is skipped
    /// with a warning, and an enumeration failure yields an empty list so the
    /// scrape proceeds with cluster-wide collectors only.
    pub async fn datasources(&self, base: &PgPool) -> Vec<(String, PgPool)> {
        if self.settings.mode == PerDbMode::None {
            return Vec::new();
        }

        let names = match enumerate_databases(base).await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to enumerate databases, skipping per-database collectors");
                return Vec::new();
            }
        };

        let allowed = filter_databases(names, self.settings.mode, &self.settings.db_list);
        debug!(count = allowed.len(), "allowed databases for this scrape");

        let mut out = Vec::with_capacity(allowed.len());
        for name in allowed {
            match self.pool_for(&name).await {
                Ok(pool) => out.push((name, pool)),
                Err(e) => warn!(database = %name, error = %e, "skipping database"),
            }
        }
        out
    }

    async fn pool_for(&self, name: &str) -> Result<PgPool> {
        if self.settings.cache_enabled {
            let mut cached = self.cached.lock().await;
            if let Some(pool) = cached.get(name) {
                return Ok(pool.clone());
            }
            let pool = datasource::per_db_pool(&self.dsn, name).await?;
            cached.insert(name.to_string(), pool.clone());
            return Ok(pool);
        }

        let pool = datasource::per_db_pool(&self.dsn, name).await?;
        self.temporary.lock().await.push(pool.clone());
        Ok(pool)
    }

    /// Close every pool created for the current scrape.
    ///
    /// Idempotent; a no-op when caching is enabled or nothing was created.
    pub async fn cleanup(&self) {
        let drained: Vec<PgPool> = self.temporary.lock().await.drain(..).collect();
        for pool in drained {
            pool.close().await;
        }
    }

    /// Close everything, cached pools included. Called once at shutdown.
    pub async fn shutdown(&self) {
        self.cleanup().await;
        let cached: Vec<PgPool> = self.cached.lock().await.drain().map(|(_, p)| p).collect();
        for pool in cached {
            pool.close().await;
        }
    }
}

/// Apply the per-db mode filter to the enumerated database names.
#[must_use]
pub fn filter_databases(names: Vec<String>, mode: PerDbMode, list: &[String]) -> Vec<String> {
    match mode {
        PerDbMode::All => names,
        PerDbMode::Include => names
            .into_iter()
            .filter(|n| list.iter().any(|l| l == n))
            .collect(),
        PerDbMode::Exclude => names
            .into_iter()
            .filter(|n| !list.iter().any(|l| l == n))
            .collect(),
        PerDbMode::None => Vec::new(),
    }
}

async fn enumerate_databases(pool: &PgPool) -> Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT datname FROM pg_database
         WHERE datallowconn AND NOT datistemplate
         ORDER BY datname",
    )
    .fetch_all(pool)
    .await?;
    Ok(names)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_filter_all_keeps_everything() {
        let got = filter_databases(names(&["postgres", "mydb"]), PerDbMode::All, &[]);
        assert_eq!(got, names(&["postgres", "mydb"]));
    }

    #[test]
    fn test_filter_include_intersects() {
        let got = filter_databases(
            names(&["postgres", "mydb", "other"]),
            PerDbMode::Include,
            &names(&["mydb", "absent"]),
        );
        assert_eq!(got, names(&["mydb"]));
    }

    #[test]
    fn test_filter_exclude_subtracts() {
        let got = filter_databases(
            names(&["postgres", "mydb", "template1"]),
            PerDbMode::Exclude,
            &names(&["mydb"]),
        );
        assert_eq!(got, names(&["postgres", "template1"]));
    }

    #[test]
    fn test_filter_none_is_empty() {
        let got = filter_databases(names(&["postgres"]), PerDbMode::None, &[]);
        assert!(got.is_empty());
    }

    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://nobody@127.0.0.1:1/none")
            .unwrap()
    }

    fn provider(cache_enabled: bool) -> DatabaseProvider {
        DatabaseProvider::new(
            SecretString::from("postgres://nobody@127.0.0.1:1/none".to_string()),
            PerDbSettings {
                mode: PerDbMode::All,
                db_list: Vec::new(),
                cache_enabled,
            },
        )
    }

    #[tokio::test]
    async fn test_cleanup_closes_temporary_pools() {
        let p = provider(false);

        let a = lazy_pool();
        let b = lazy_pool();
        p.temporary.lock().await.push(a.clone());
        p.temporary.lock().await.push(b.clone());

        p.cleanup().await;
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(p.temporary.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_safe_when_empty() {
        let p = provider(false);
        p.cleanup().await;
        p.cleanup().await;

        let a = lazy_pool();
        p.temporary.lock().await.push(a.clone());
        p.cleanup().await;
        p.cleanup().await;
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_cleanup_leaves_cached_pools_open() {
        let p = provider(true);

        let cached = lazy_pool();
        p.cached
            .lock()
            .await
            .insert("mydb".to_string(), cached.clone());

        p.cleanup().await;
        assert!(!cached.is_closed());

        p.shutdown().await;
        assert!(cached.is_closed());
    }

    #[tokio::test]
    async fn test_datasources_none_mode_returns_empty_without_enumeration() {
        let p = DatabaseProvider::new(
            SecretString::from("postgres://nobody@127.0.0.1:1/none".to_string()),
            PerDbSettings {
                mode: PerDbMode::None,
                db_list: Vec::new(),
                cache_enabled: true,
            },
        );
        // The pool is unreachable; NONE mode must not even try to use it.
        let got = p.datasources(&lazy_pool()).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_datasources_empty_on_enumeration_failure() {
        let p = provider(true);
        // Nothing listens on the lazy pool's address: enumeration fails and
        // the provider degrades to an empty list.
        let got = p.datasources(&lazy_pool()).await;
        assert!(got.is_empty());
    }
}
