use crate::collectors::Collector;
use crate::collectors::entity::EntityStore;
use crate::collectors::util::{count_f64, i64_f64};
use crate::db::Version;
use crate::metrics::SupplierGauge;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use prometheus::Registry;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info_span, instrument};
use tracing_futures::Instrument as _;

/// Size of every connectable database, plus the database count rollup.
///
/// Databases churn slowly; a dropped database keeps its meter (reading NaN)
/// until restart, which keeps dashboards stable across accidental drops.
#[derive(Clone)]
pub struct DatabaseSizeCollector {
    store: Arc<EntityStore<String, i64>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for DatabaseSizeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseSizeCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_database(&self, registry: &Registry, key: &String) -> Result<Vec<SupplierGauge>> {
        let gauge = SupplierGauge::new(
            "greengage_database_size_bytes",
            "Disk space used by the database",
            &[("database", key.clone())],
            self.store.value_supplier(key.clone(), |v| i64_f64(*v)),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for DatabaseSizeCollector {
    fn name(&self) -> &'static str {
        "database_size"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _count = SupplierGauge::new(
            "greengage_server_database_count",
            "Number of connectable, non-template databases",
            &[],
            self.store.aggregate_supplier(|m| count_f64(m.len())),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("database size collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "database_size"))]
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

            let query_span = info_span!(
                "db.query",
                db.operation = "SELECT",
                db.sql.table = "pg_database"
            );

            let rows = sqlx::query(
                "SELECT datname, pg_database_size(datname) AS size
                 FROM pg_database
                 WHERE datallowconn AND NOT datistemplate
                 ORDER BY datname",
            )
            .fetch_all(pool)
            .instrument(query_span)
            .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let datname: String = row.try_get("datname")?;
                let size: i64 = row.try_get("size")?;
                entities.insert(datname, size);
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_database(registry, key)
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_count_and_sizes() {
        let collector = DatabaseSizeCollector::new();
        let registry = Registry::new();
        collector.register_metrics(&registry).unwrap();

        let entities: HashMap<String, i64> = [
            ("postgres".to_string(), 8_000_000),
            ("mydb".to_string(), 42_000_000),
        ]
        .into();
        collector
            .store
            .apply(&registry, entities, |r, k| {
                collector.register_database(r, k)
            })
            .unwrap();

        let count = collector.store.aggregate_supplier(|m| count_f64(m.len()));
        assert_eq!(count(), 2.0);

        let size = collector
            .store
            .value_supplier("mydb".to_string(), |v| i64_f64(*v));
        assert_eq!(size(), 42_000_000.0);
    }

    #[test]
    fn test_dropped_database_reads_nan() {
        let collector = DatabaseSizeCollector::new();
        let registry = Registry::new();
        collector.register_metrics(&registry).unwrap();

        collector
            .store
            .apply(&registry, [("gone".to_string(), 1)].into(), |r, k| {
                collector.register_database(r, k)
            })
            .unwrap();
        collector
            .store
            .apply(&registry, [("kept".to_string(), 2)].into(), |r, k| {
                collector.register_database(r, k)
            })
            .unwrap();

        let gone = collector
            .store
            .value_supplier("gone".to_string(), |v| i64_f64(*v));
        assert!(gone().is_nan());
    }
}
