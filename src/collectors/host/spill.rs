use crate::collectors::Collector;
use crate::collectors::entity::EntityStore;
use crate::collectors::util::{i64_f64, skew_ratio};
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

#[derive(Clone, Debug)]
pub struct SpillRow {
    pub files: i64,
    pub bytes: f64,
}

/// Workfile (spill) usage aggregated per segment host. A host with no spill
/// files drops out of the result set and reads zero; the skew rollup exposes
/// hot spots.
#[derive(Clone)]
pub struct SpillFilesCollector {
    store: Arc<EntityStore<String, SpillRow>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for SpillFilesCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SpillFilesCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_host(&self, registry: &Registry, key: &String) -> Result<Vec<SupplierGauge>> {
        let labels = [("hostname", key.clone())];

        let files = SupplierGauge::new(
            "greengage_host_spill_files",
            "Number of workfiles on the host",
            &labels,
            self.store
                .value_supplier_or(key.clone(), 0.0, |v| i64_f64(v.files)),
        )?
        .register(registry)?;

        let bytes = SupplierGauge::new(
            "greengage_host_spill_file_bytes",
            "Total workfile size on the host",
            &labels,
            self.store.value_supplier_or(key.clone(), 0.0, |v| v.bytes),
        )?
        .register(registry)?;

        Ok(vec![files, bytes])
    }
}

impl Collector for SpillFilesCollector {
    fn name(&self) -> &'static str {
        "spill_files"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _total_files = SupplierGauge::new(
            "greengage_host_spill_files_total",
            "Number of workfiles across all hosts",
            &[],
            self.store
                .aggregate_supplier(|m| i64_f64(m.values().map(|v| v.files).sum())),
        )?
        .register(registry)?;

        let _total_bytes = SupplierGauge::new(
            "greengage_host_spill_file_bytes_total",
            "Workfile bytes across all hosts",
            &[],
            self.store
                .aggregate_supplier(|m| m.values().map(|v| v.bytes).sum()),
        )?
        .register(registry)?;

        let _skew = SupplierGauge::new(
            "greengage_host_spill_files_skew",
            "max/avg workfile count across hosts; 1 is balanced",
            &[],
            self.store
                .aggregate_supplier(|m| skew_ratio(m.values().map(|v| i64_f64(v.files)))),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("spill collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "spill_files"))]
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
                "SELECT c.hostname,
                        COUNT(*) AS files,
                        COALESCE(SUM(w.size), 0)::float8 AS bytes
                 FROM gp_toolkit.gp_workfile_entries w
                 JOIN gp_segment_configuration c
                   ON w.segid = c.content AND c.role = 'p'
                 GROUP BY 1",
            )
            .fetch_all(pool)
            .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let hostname: String = row.try_get("hostname")?;
                entities.insert(
                    hostname,
                    SpillRow {
                        files: row.try_get("files")?,
                        bytes: row.try_get("bytes")?,
                    },
                );
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_host(registry, key)
            })
        })
    }
}
