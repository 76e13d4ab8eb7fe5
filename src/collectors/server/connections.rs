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
use tracing::instrument;

/// Session counts by `pg_stat_activity` state. The key set is the small
/// enumerated state vocabulary, so meters stabilize after the first scrapes;
/// a state with no sessions reads 0.
#[derive(Clone)]
pub struct ConnectionsCollector {
    store: Arc<EntityStore<String, i64>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for ConnectionsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_state(&self, registry: &Registry, key: &String) -> Result<Vec<SupplierGauge>> {
        let gauge = SupplierGauge::new(
            "greengage_server_connections",
            "Number of sessions per state",
            &[("state", key.clone())],
            self.store
                .value_supplier_or(key.clone(), 0.0, |v| i64_f64(*v)),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for ConnectionsCollector {
    fn name(&self) -> &'static str {
        "connections"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _total = SupplierGauge::new(
            "greengage_server_connections_total",
            "Total number of sessions",
            &[],
            self.store
                .aggregate_supplier(|m| i64_f64(m.values().sum::<i64>())),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("connections collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "connections"))]
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
                "SELECT COALESCE(state, 'unknown') AS state, COUNT(*) AS count
                 FROM pg_stat_activity
                 GROUP BY 1
                 ORDER BY 1",
            )
            .fetch_all(pool)
            .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let state: String = row.try_get("state")?;
                let count: i64 = row.try_get("count")?;
                entities.insert(state, count);
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_state(registry, key)
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_state_reads_zero() {
        let collector = ConnectionsCollector::new();
        let registry = Registry::new();
        collector.register_metrics(&registry).unwrap();

        let entities: HashMap<String, i64> =
            [("active".to_string(), 3), ("idle".to_string(), 5)].into();
        collector
            .store
            .apply(&registry, entities, |r, k| collector.register_state(r, k))
            .unwrap();

        // "active" disappears on the next scrape but its meter stays and reads 0.
        collector
            .store
            .apply(&registry, [("idle".to_string(), 6)].into(), |r, k| {
                collector.register_state(r, k)
            })
            .unwrap();

        let active = collector
            .store
            .value_supplier_or("active".to_string(), 0.0, |v| i64_f64(*v));
        assert_eq!(active(), 0.0);

        let total = collector.store.with_snapshot(|m| m.values().sum::<i64>());
        assert_eq!(total, 6);
    }
}
