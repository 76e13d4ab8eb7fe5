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

/// Runtime buckets for active queries. The label vocabulary is fixed, so the
/// full set is seeded every scrape and empty buckets read 0.
pub const DURATION_BUCKETS: &[&str] = &[
    "lt_1min",
    "1min_5min",
    "5min_15min",
    "15min_60min",
    "gt_60min",
];

const ACTIVE_QUERIES_SQL: &str = "\
    SELECT CASE
             WHEN now() - query_start < interval '1 minute'   THEN 'lt_1min'
             WHEN now() - query_start < interval '5 minutes'  THEN '1min_5min'
             WHEN now() - query_start < interval '15 minutes' THEN '5min_15min'
             WHEN now() - query_start < interval '60 minutes' THEN '15min_60min'
             ELSE 'gt_60min'
           END AS bucket,
           COUNT(*) AS count
    FROM pg_stat_activity
    WHERE state = 'active'
      AND pid <> pg_backend_pid()
      AND query_start IS NOT NULL
    GROUP BY 1";

/// Count of active queries by how long they have been running.
#[derive(Clone)]
pub struct ActiveQueryDurationCollector {
    store: Arc<EntityStore<String, i64>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for ActiveQueryDurationCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveQueryDurationCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_bucket(&self, registry: &Registry, key: &String) -> Result<Vec<SupplierGauge>> {
        let gauge = SupplierGauge::new(
            "greengage_query_running_count",
            "Number of active queries per runtime bucket",
            &[("bucket", key.clone())],
            self.store
                .value_supplier_or(key.clone(), 0.0, |v| i64_f64(*v)),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }
}

impl Collector for ActiveQueryDurationCollector {
    fn name(&self) -> &'static str {
        "query_duration"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _total = SupplierGauge::new(
            "greengage_query_running_total",
            "Number of active queries",
            &[],
            self.store
                .aggregate_supplier(|m| i64_f64(m.values().sum::<i64>())),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("query duration collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "query_duration"))]
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

            let rows = sqlx::query(ACTIVE_QUERIES_SQL).fetch_all(pool).await?;

            // Seed the whole vocabulary so every bucket is registered on the
            // first scrape and observed zeros read 0, not NaN.
            let mut entities: HashMap<String, i64> = DURATION_BUCKETS
                .iter()
                .map(|b| ((*b).to_string(), 0))
                .collect();

            for row in &rows {
                let bucket: String = row.try_get("bucket")?;
                let count: i64 = row.try_get("count")?;
                entities.insert(bucket, count);
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_bucket(registry, key)
            })
        })
    }

    fn fail_on_error(&self) -> bool {
        false
    }
}
