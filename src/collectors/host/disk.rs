use crate::collectors::Collector;
use crate::collectors::entity::EntityStore;
use crate::collectors::util::skew_ratio;
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

/// Free disk space per segment host, read through the `gp_toolkit` external
/// table. That table shells out on every segment, so this collector tolerates
/// failures instead of aborting the scrape.
#[derive(Clone)]
pub struct DiskSpaceCollector {
    store: Arc<EntityStore<String, f64>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for DiskSpaceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskSpaceCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_host(&self, registry: &Registry, key: &String) -> Result<Vec<SupplierGauge>> {
        let gauge = SupplierGauge::new(
            "greengage_host_disk_free_bytes",
            "Free bytes on the host's data filesystems",
            &[("hostname", key.clone())],
            self.store.value_supplier(key.clone(), |v| *v),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for DiskSpaceCollector {
    fn name(&self) -> &'static str {
        "disk_space"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _total = SupplierGauge::new(
            "greengage_host_disk_free_bytes_total",
            "Free bytes across all hosts",
            &[],
            self.store.aggregate_supplier(|m| m.values().sum()),
        )?
        .register(registry)?;

        let _skew = SupplierGauge::new(
            "greengage_host_disk_free_skew",
            "max/avg free bytes across hosts; 1 is balanced",
            &[],
            self.store
                .aggregate_supplier(|m| skew_ratio(m.values().copied())),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("disk collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "disk_space"))]
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

            // dfspace is reported in kilobytes.
            let rows = sqlx::query(
                "SELECT dfhostname AS hostname,
                        (SUM(dfspace) * 1024)::float8 AS free_bytes
                 FROM gp_toolkit.gp_disk_free
                 GROUP BY 1",
            )
            .fetch_all(pool)
            .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let hostname: String = row.try_get("hostname")?;
                let free: f64 = row.try_get("free_bytes")?;
                entities.insert(hostname, free);
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_host(registry, key)
            })
        })
    }

    fn fail_on_error(&self) -> bool {
        false
    }
}
