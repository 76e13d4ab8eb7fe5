use crate::collectors::entity::EntityStore;
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

/// Transaction-id age of each database's `datfrozenxid`, collected from
/// inside the database so the value reflects the catalog the autovacuum
/// daemon actually consults.
#[derive(Clone)]
pub struct DatabaseVacuumCollector {
    store: Arc<EntityStore<String, f64>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for DatabaseVacuumCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseVacuumCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_database(&self, registry: &Registry, key: &String) -> Result<Vec<SupplierGauge>> {
        let gauge = SupplierGauge::new(
            "greengage_database_vacuum_age",
            "Age of the database's datfrozenxid in transactions",
            &[("database", key.clone())],
            self.store.value_supplier(key.clone(), |v| *v),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for DatabaseVacuumCollector {
    fn name(&self) -> &'static str {
        "db_vacuum"
    }

    fn group(&self) -> CollectorGroup {
        CollectorGroup::PerDb
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("db vacuum collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "db_vacuum"))]
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

            let row = sqlx::query(
                "SELECT datname, age(datfrozenxid)::float8 AS xid_age
                 FROM pg_database
                 WHERE datname = current_database()",
            )
            .fetch_one(pool)
            .await?;

            let datname: String = row.try_get("datname")?;
            let xid_age: f64 = row.try_get("xid_age")?;

            let entities: HashMap<String, f64> = [(datname.clone(), xid_age)].into();

            self.store.apply_scoped(
                registry,
                entities,
                |key| *key == datname,
                |registry, key| self.register_database(registry, key),
            )
        })
    }
}
