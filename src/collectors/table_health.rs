use crate::collectors::entity::EntityStore;
use crate::collectors::util::{bloat_state, count_f64};
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
use tracing::instrument;

/// Table identity within one database.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HealthKey {
    pub database: String,
    pub schema: String,
    pub table: String,
}

#[derive(Clone, Debug)]
pub struct BloatRow {
    pub pages: f64,
    pub expected_pages: f64,
}

/// Bloat diagnostics per table, from `gp_toolkit.gp_bloat_diag`.
///
/// Deprecated: the diagnostic view scans statistics for every heap table and
/// is expensive on large clusters, so this collector is opt-in.
#[derive(Clone)]
pub struct TableHealthCollector {
    store: Arc<EntityStore<HealthKey, BloatRow>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for TableHealthCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TableHealthCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_table(&self, registry: &Registry, key: &HealthKey) -> Result<Vec<SupplierGauge>> {
        let labels = [
            ("database", key.database.clone()),
            ("schema", key.schema.clone()),
            ("table", key.table.clone()),
        ];

        let gauge = SupplierGauge::new(
            "greengage_database_table_bloat",
            "Bloat severity: 0 none, 1 moderate, 2 severe",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| bloat_state(v.pages, v.expected_pages)),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for TableHealthCollector {
    fn name(&self) -> &'static str {
        "table_health"
    }

    fn group(&self) -> CollectorGroup {
        CollectorGroup::PerDb
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _bloated = SupplierGauge::new(
            "greengage_database_table_bloat_count",
            "Number of tables with any detected bloat",
            &[],
            self.store.aggregate_supplier(|m| {
                count_f64(
                    m.values()
                        .filter(|v| bloat_state(v.pages, v.expected_pages) > 0.0)
                        .count(),
                )
            }),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("table health collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "table_health"))]
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

            let rows = sqlx::query(
                "SELECT current_database() AS datname,
                        bdinspname AS schemaname,
                        bdirelname AS relname,
                        bdirelpages::float8 AS pages,
                        bdiexppages::float8 AS expected_pages
                 FROM gp_toolkit.gp_bloat_diag",
            )
            .fetch_all(pool)
            .await?;

            let database: String = sqlx::query_scalar("SELECT current_database()")
                .fetch_one(pool)
                .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let key = HealthKey {
                    database: row.try_get("datname")?,
                    schema: row.try_get("schemaname")?,
                    table: row.try_get("relname")?,
                };
                entities.insert(
                    key,
                    BloatRow {
                        pages: row.try_get("pages")?,
                        expected_pages: row.try_get("expected_pages")?,
                    },
                );
            }

            self.store.apply_scoped(
                registry,
                entities,
                |key| key.database == database,
                |registry, key| self.register_table(registry, key),
            )
        })
    }

    fn enabled_by_default(&self) -> bool {
        false
    }

    fn fail_on_error(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_bloat_severity_and_rollup() {
        let collector = TableHealthCollector::new();
        let registry = Registry::new();
        collector.register_metrics(&registry).unwrap();

        let key = |table: &str| HealthKey {
            database: "db1".to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
        };

        let entities: HashMap<HealthKey, BloatRow> = [
            (
                key("clean"),
                BloatRow {
                    pages: 100.0,
                    expected_pages: 100.0,
                },
            ),
            (
                key("bloated"),
                BloatRow {
                    pages: 5000.0,
                    expected_pages: 100.0,
                },
            ),
        ]
        .into();

        collector
            .store
            .apply_scoped(
                &registry,
                entities,
                |k| k.database == "db1",
                |r, k| collector.register_table(r, k),
            )
            .unwrap();

        let severe = collector
            .store
            .value_supplier(key("bloated"), |v| bloat_state(v.pages, v.expected_pages));
        assert_eq!(severe(), 2.0);

        let bloated_count = collector.store.aggregate_supplier(|m| {
            count_f64(
                m.values()
                    .filter(|v| bloat_state(v.pages, v.expected_pages) > 0.0)
                    .count(),
            )
        });
        assert_eq!(bloated_count(), 1.0);
    }

    #[test]
    fn test_disabled_by_default_and_tolerant() {
        let collector = TableHealthCollector::new();
        assert!(!collector.enabled_by_default());
        assert!(!collector.fail_on_error());
        assert_eq!(collector.group(), CollectorGroup::PerDb);
    }
}
