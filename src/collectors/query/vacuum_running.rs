use crate::collectors::Collector;
use crate::collectors::entity::EntityStore;
use crate::collectors::util::text_or_unknown;
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

/// A vacuum session. These come and go within minutes, so deletion cleanup
/// is on: finished vacuums disappear from the registry, not just from the
/// snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VacuumKey {
    pub datname: String,
    pub pid: i32,
    pub usename: String,
}

/// Currently running VACUUM statements and their runtime.
#[derive(Clone)]
pub struct VacuumRunningCollector {
    store: Arc<EntityStore<VacuumKey, f64>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for VacuumRunningCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl VacuumRunningCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(true)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_vacuum(&self, registry: &Registry, key: &VacuumKey) -> Result<Vec<SupplierGauge>> {
        let labels = [
            ("database", key.datname.clone()),
            ("pid", key.pid.to_string()),
            ("user", key.usename.clone()),
        ];

        let gauge = SupplierGauge::new(
            "greengage_query_vacuum_running_seconds",
            "Runtime of the vacuum session",
            &labels,
            self.store.value_supplier(key.clone(), |v| *v),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for VacuumRunningCollector {
    fn name(&self) -> &'static str {
        "vacuum_running"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("vacuum running collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "vacuum_running"))]
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
                "SELECT datname, pid, usename,
                        EXTRACT(EPOCH FROM now() - query_start)::float8 AS runtime
                 FROM pg_stat_activity
                 WHERE query ILIKE 'vacuum%'
                   AND pid <> pg_backend_pid()",
            )
            .fetch_all(pool)
            .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let key = VacuumKey {
                    datname: text_or_unknown(row.try_get("datname")?),
                    pid: row.try_get("pid")?,
                    usename: text_or_unknown(row.try_get("usename")?),
                };
                let runtime: Option<f64> = row.try_get("runtime")?;
                entities.insert(key, runtime.unwrap_or(0.0));
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_vacuum(registry, key)
            })
        })
    }
}
