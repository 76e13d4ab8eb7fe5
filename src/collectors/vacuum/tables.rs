use crate::collectors::entity::EntityStore;
use crate::collectors::util::{self, i64_f64};
use crate::collectors::{Collector, CollectorGroup};
use crate::db::Version;
use crate::metrics::SupplierGauge;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use prometheus::Registry;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Fully qualified table identity, database included: per-database runs only
/// replace their own slice of the snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub database: String,
    pub schema: String,
    pub table: String,
}

#[derive(Clone, Debug)]
pub struct TableVacuumRow {
    /// Seconds since the last (auto)vacuum; None when never vacuumed.
    pub since_vacuum: Option<f64>,
    pub dead_tuples: i64,
}

/// Vacuum statistics for user tables above the live-tuple threshold, per
/// database.
#[derive(Clone)]
pub struct TableVacuumCollector {
    store: Arc<EntityStore<TableKey, TableVacuumRow>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for TableVacuumCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TableVacuumCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_table(&self, registry: &Registry, key: &TableKey) -> Result<Vec<SupplierGauge>> {
        let labels = [
            ("database", key.database.clone()),
            ("schema", key.schema.clone()),
            ("table", key.table.clone()),
        ];

        let age = SupplierGauge::new(
            "greengage_database_table_last_vacuum_seconds",
            "Seconds since the table was last vacuumed; NaN when never",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| v.since_vacuum.unwrap_or(f64::NAN)),
        )?
        .register(registry)?;

        let dead = SupplierGauge::new(
            "greengage_database_table_dead_tuples",
            "Estimated dead tuples in the table",
            &labels,
            self.store
                .value_supplier_or(key.clone(), 0.0, |v| i64_f64(v.dead_tuples)),
        )?
        .register(registry)?;

        Ok(vec![age, dead])
    }
}

impl Collector for TableVacuumCollector {
    fn name(&self) -> &'static str {
        "table_vacuum"
    }

    fn group(&self) -> CollectorGroup {
        CollectorGroup::PerDb
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("table vacuum collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "table_vacuum"))]
    fn collect<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a Version,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let registry = self
                .registry
                .get()
                .ok_or_else(|| anyhow!("collector metrics not registered"))?;

            let threshold = util::tunables().table_vacuum_tuple_threshold;

            let rows = sqlx::query(
                "SELECT current_database() AS datname,
                        schemaname,
                        relname,
                        EXTRACT(EPOCH FROM now() - GREATEST(last_vacuum, last_autovacuum))::float8
                            AS since_vacuum,
                        n_dead_tup AS dead_tuples
                 FROM pg_stat_all_tables
                 WHERE n_live_tup >= $1
                   AND schemaname NOT IN ('pg_catalog', 'information_schema', 'gp_toolkit')",
            )
            .bind(threshold)
            .fetch_all(pool)
            .await?;

            let database: String = sqlx::query_scalar("SELECT current_database()")
                .fetch_one(pool)
                .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let key = TableKey {
                    database: row.try_get("datname")?,
                    schema: row.try_get("schemaname")?,
                    table: row.try_get("relname")?,
                };
                entities.insert(
                    key,
                    TableVacuumRow {
                        since_vacuum: row.try_get("since_vacuum")?,
                        dead_tuples: row.try_get("dead_tuples")?,
                    },
                );
            }

            debug!(database = %database, tables = entities.len(), "collected vacuum statistics");

            self.store.apply_scoped(
                registry,
                entities,
                |key| key.database == database,
                |registry, key| self.register_table(registry, key),
            )
        })
    }
}
