use crate::collectors::Collector;
use crate::collectors::entity::EntityStore;
use crate::collectors::util;
use crate::db::Version;
use crate::metrics::SupplierGauge;
use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use prometheus::Registry;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;
use url::Url;

// Latest finished backup per (database, incremental, status). The window
// form is deterministic for ties, unlike GROUP BY + MAX over mixed columns.
const LAST_BACKUPS_SQL: &str = "\
    SELECT database_name, incremental, status,
           CAST(strftime('%s', end_time) AS INTEGER) AS end_epoch,
           CAST(strftime('%s', end_time) AS INTEGER)
             - CAST(strftime('%s', start_time) AS INTEGER) AS duration
    FROM (
        SELECT database_name, incremental, status, start_time, end_time,
               ROW_NUMBER() OVER (
                   PARTITION BY database_name, incremental, status
                   ORDER BY end_time DESC
               ) AS rn
        FROM backups
        WHERE end_time IS NOT NULL
    ) ranked
    WHERE rn = 1";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackupKey {
    pub database: String,
    pub incremental: bool,
    pub status: String,
}

#[derive(Clone, Debug)]
pub struct BackupRow {
    pub end_epoch: f64,
    pub duration: f64,
}

/// gpbackup history, read from the history SQLite file next to gpbackup's
/// own state — the only collector with a secondary datasource. Old
/// `(database, incremental, status)` combinations disappear as history rolls
/// over, so deletion cleanup is on.
#[derive(Clone)]
pub struct BackupHistoryCollector {
    store: Arc<EntityStore<BackupKey, BackupRow>>,
    registry: Arc<OnceCell<Registry>>,
    pool: Arc<OnceCell<SqlitePool>>,
}

impl Default for BackupHistoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupHistoryCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(true)),
            registry: Arc::new(OnceCell::new()),
            pool: Arc::new(OnceCell::new()),
        }
    }

    async fn history_pool(&self) -> Result<&SqlitePool> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }

        let raw = util::tunables()
            .backup_history_url
            .ok_or_else(|| anyhow!("backup history collector enabled but no history URL configured"))?;

        let options = SqliteConnectOptions::from_str(&normalize_history_url(&raw))
            .context("malformed backup history URL")?
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open backup history database")?;

        // A concurrent collect may have won the race; use whichever landed.
        let _ = self.pool.set(pool);
        self.pool
            .get()
            .ok_or_else(|| anyhow!("backup history pool initialization raced"))
    }

    fn register_backup(&self, registry: &Registry, key: &BackupKey) -> Result<Vec<SupplierGauge>> {
        let labels = [
            ("database", key.database.clone()),
            ("incremental", key.incremental.to_string()),
            ("status", key.status.clone()),
        ];

        let end = SupplierGauge::new(
            "greengage_gpbackup_last_end_timestamp",
            "Unix timestamp at which the most recent matching backup finished",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| v.end_epoch),
        )?
        .register(registry)?;

        let duration = SupplierGauge::new(
            "greengage_gpbackup_last_duration_seconds",
            "Duration of the most recent matching backup",
            &labels,
            self.store.value_supplier(key.clone(), |v| v.duration),
        )?
        .register(registry)?;

        Ok(vec![end, duration])
    }
}

/// Accept either a `sqlite:` URL or a bare filesystem path.
fn normalize_history_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "sqlite" => raw.to_string(),
        _ => format!("sqlite://{raw}"),
    }
}

impl Collector for BackupHistoryCollector {
    fn name(&self) -> &'static str {
        "backup_history"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("backup history collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, _pool, _version), level = "debug", err, fields(collector = "backup_history"))]
    fn collect<'a>(
        &'a self,
        _pool: &'a PgPool,
        _version: &'a Version,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let registry = self
                .registry
                .get()
                .ok_or_else(|| anyhow!("collector metrics not registered"))?;

            let history = self.history_pool().await?;
            let rows = sqlx::query(LAST_BACKUPS_SQL).fetch_all(history).await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let incremental: i64 = row.try_get("incremental")?;
                let key = BackupKey {
                    database: row.try_get("database_name")?,
                    incremental: incremental != 0,
                    status: row.try_get("status")?,
                };
                let end_epoch: i64 = row.try_get("end_epoch")?;
                let duration: i64 = row.try_get("duration")?;
                entities.insert(
                    key,
                    BackupRow {
                        end_epoch: util::i64_f64(end_epoch),
                        duration: util::i64_f64(duration),
                    },
                );
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_backup(registry, key)
            })
        })
    }

    fn enabled_by_default(&self) -> bool {
        false
    }
}
