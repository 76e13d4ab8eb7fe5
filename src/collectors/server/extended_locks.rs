use crate::collectors::Collector;
use crate::collectors::entity::EntityStore;
use crate::collectors::util::i64_f64;
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

/// Identity of one lock aggregation row. High-churn: the set of live
/// combinations changes with the workload, so deletion cleanup is on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockDetailKey {
    pub datname: String,
    pub locktype: String,
    pub mode: String,
    pub granted: bool,
    pub segment: i32,
}

/// Per-(database, locktype, mode, granted, segment) lock counts.
#[derive(Clone)]
pub struct ExtendedLocksCollector {
    store: Arc<EntityStore<LockDetailKey, i64>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for ExtendedLocksCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtendedLocksCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(true)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_detail(
        &self,
        registry: &Registry,
        key: &LockDetailKey,
    ) -> Result<Vec<SupplierGauge>> {
        let labels = [
            ("datname", key.datname.clone()),
            ("locktype", key.locktype.clone()),
            ("mode", key.mode.clone()),
            ("granted", key.granted.to_string()),
            ("gp_segment_id", key.segment.to_string()),
        ];

        let gauge = SupplierGauge::new(
            "greengage_server_locks_detail",
            "Number of locks per database, lock type, mode, grant state and segment",
            &labels,
            self.store
                .value_supplier_or(key.clone(), 0.0, |v| i64_f64(*v)),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for ExtendedLocksCollector {
    fn name(&self) -> &'static str {
        "extended_locks"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("extended locks collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "extended_locks"))]
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
                db.sql.table = "pg_locks"
            );

            let rows = sqlx::query(
                "SELECT COALESCE(d.datname, 'unknown') AS datname,
                        l.locktype,
                        l.mode,
                        l.granted,
                        COALESCE(l.gp_segment_id, -1)::int4 AS segment,
                        COUNT(*) AS count
                 FROM pg_locks l
                 LEFT JOIN pg_database d ON l.database = d.oid
                 GROUP BY 1, 2, 3, 4, 5",
            )
            .fetch_all(pool)
            .instrument(query_span)
            .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let key = LockDetailKey {
                    datname: row.try_get("datname")?,
                    locktype: row.try_get("locktype")?,
                    mode: row.try_get("mode")?,
                    granted: row.try_get("granted")?,
                    segment: row.try_get("segment")?,
                };
                let count: i64 = row.try_get("count")?;
                entities.insert(key, count);
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_detail(registry, key)
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(datname: &str, mode: &str) -> LockDetailKey {
        LockDetailKey {
            datname: datname.to_string(),
            locktype: "relation".to_string(),
            mode: mode.to_string(),
            granted: true,
            segment: -1,
        }
    }

    #[test]
    fn test_churned_combination_is_unregistered() {
        let collector = ExtendedLocksCollector::new();
        let registry = Registry::new();
        collector.register_metrics(&registry).unwrap();

        collector
            .store
            .apply(
                &registry,
                [(key("postgres", "AccessShareLock"), 3)].into(),
                |r, k| collector.register_detail(r, k),
            )
            .unwrap();

        collector
            .store
            .apply(
                &registry,
                [(key("mydb", "RowExclusiveLock"), 1)].into(),
                |r, k| collector.register_detail(r, k),
            )
            .unwrap();

        let modes: Vec<String> = registry
            .gather()
            .iter()
            .filter(|mf| mf.name() == "greengage_server_locks_detail")
            .flat_map(|mf| {
                mf.get_metric()
                    .iter()
                    .flat_map(|m| {
                        m.get_label()
                            .iter()
                            .filter(|l| l.name() == "mode")
                            .map(|l| l.value().to_string())
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        assert_eq!(modes, vec!["RowExclusiveLock".to_string()]);
    }
}
