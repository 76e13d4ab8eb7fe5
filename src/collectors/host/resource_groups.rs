use crate::collectors::Collector;
use crate::collectors::entity::EntityStore;
use crate::collectors::util::count_f64;
use crate::db::Version;
use crate::metrics::SupplierGauge;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use prometheus::Registry;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;

// The per-host resource group view renamed its usage columns in v7.
const RSG_SQL_V6: &str = "\
    SELECT rsgname, hostname,
           cpu::float8 AS cpu,
           memory_used::float8 AS memory
    FROM gp_toolkit.gp_resgroup_status_per_host";

const RSG_SQL_V7: &str = "\
    SELECT rsgname, hostname,
           cpu_usage::float8 AS cpu,
           memory_usage::float8 AS memory
    FROM gp_toolkit.gp_resgroup_status_per_host";

#[derive(Clone, Debug)]
pub struct ResourceGroupRow {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
}

/// Resource group CPU and memory usage per `(group, host)`.
#[derive(Clone)]
pub struct ResourceGroupCollector {
    store: Arc<EntityStore<(String, String), ResourceGroupRow>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for ResourceGroupCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceGroupCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_group_host(
        &self,
        registry: &Registry,
        key: &(String, String),
    ) -> Result<Vec<SupplierGauge>> {
        let labels = [
            ("rsgname", key.0.clone()),
            ("hostname", key.1.clone()),
        ];

        let cpu = SupplierGauge::new(
            "greengage_host_resource_group_cpu_percent",
            "CPU usage of the resource group on the host",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| v.cpu.unwrap_or(f64::NAN)),
        )?
        .register(registry)?;

        let memory = SupplierGauge::new(
            "greengage_host_resource_group_memory_used_mb",
            "Memory usage of the resource group on the host",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| v.memory.unwrap_or(f64::NAN)),
        )?
        .register(registry)?;

        Ok(vec![cpu, memory])
    }
}

impl Collector for ResourceGroupCollector {
    fn name(&self) -> &'static str {
        "resource_groups"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _groups = SupplierGauge::new(
            "greengage_host_resource_group_count",
            "Number of distinct resource groups",
            &[],
            self.store.aggregate_supplier(|m| {
                let groups: HashSet<&str> = m.keys().map(|(g, _)| g.as_str()).collect();
                count_f64(groups.len())
            }),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("resource group collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, version), level = "debug", err, fields(collector = "resource_groups"))]
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

            let sql = if version.is_at_least_v7() {
                RSG_SQL_V7
            } else {
                RSG_SQL_V6
            };

            let rows = sqlx::query(sql).fetch_all(pool).await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let rsgname: String = row.try_get("rsgname")?;
                let hostname: String = row.try_get("hostname")?;
                entities.insert(
                    (rsgname, hostname),
                    ResourceGroupRow {
                        cpu: row.try_get("cpu")?,
                        memory: row.try_get("memory")?,
                    },
                );
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_group_host(registry, key)
            })
        })
    }
}
