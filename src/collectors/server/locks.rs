use crate::collectors::Collector;
use crate::collectors::entity::{EntityStore, SnapshotCell};
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
use tracing::instrument;

// v6 still has the boolean `waiting` column; v7 replaced it with wait events.
const WAITING_SQL_V6: &str = "SELECT COUNT(*) AS waiting FROM pg_stat_activity WHERE waiting";
const WAITING_SQL_V7: &str =
    "SELECT COUNT(*) AS waiting FROM pg_stat_activity WHERE wait_event_type = 'Lock'";

/// Lock counts per lock type, plus the number of sessions waiting on a lock.
#[derive(Clone)]
pub struct LocksCollector {
    store: Arc<EntityStore<String, i64>>,
    waiting: SnapshotCell<i64>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for LocksCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl LocksCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            waiting: SnapshotCell::new(),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_lock_type(&self, registry: &Registry, key: &String) -> Result<Vec<SupplierGauge>> {
        let gauge = SupplierGauge::new(
            "greengage_server_locks",
            "Number of locks held or awaited, per lock type",
            &[("lock_type", key.clone())],
            self.store
                .value_supplier_or(key.clone(), 0.0, |v| i64_f64(*v)),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for LocksCollector {
    fn name(&self) -> &'static str {
        "locks"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _waiting = SupplierGauge::new(
            "greengage_server_locks_waiting",
            "Number of sessions currently waiting on a lock",
            &[],
            self.waiting.value_supplier_or(0.0, |v| i64_f64(*v)),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("locks collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, version), level = "debug", err, fields(collector = "locks"))]
    fn collect<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a Version,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let registry = self
                .registry
                .get()
                .ok_or_else(|| anyhow!("collector metrics not registered"))?;

            let rows = sqlx::query(
                "SELECT locktype, COUNT(*) AS count FROM pg_locks GROUP BY 1 ORDER BY 1",
            )
            .fetch_all(pool)
            .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let locktype: String = row.try_get("locktype")?;
                let count: i64 = row.try_get("count")?;
                entities.insert(locktype, count);
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_lock_type(registry, key)
            })?;

            let waiting_sql = if version.is_at_least_v7() {
                WAITING_SQL_V7
            } else {
                WAITING_SQL_V6
            };
            let waiting: i64 = sqlx::query_scalar(waiting_sql).fetch_one(pool).await?;
            self.waiting.store(waiting);

            Ok(())
        })
    }
}
