use crate::collectors::entity::EntityStore;
use crate::collectors::util::{count_f64, mode_value, role_value, status_value};
use crate::collectors::Collector;
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

/// One row of `gp_segment_configuration`, keyed by `(hostname, dbid)`.
#[derive(Clone, Debug)]
pub struct SegmentRow {
    pub status: Option<String>,
    pub role: Option<String>,
    pub mode: Option<String>,
}

/// Segment membership and health. Membership is stable, so per-segment
/// meters are registered once and never removed.
#[derive(Clone)]
pub struct SegmentCollector {
    store: Arc<EntityStore<(String, i32), SegmentRow>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for SegmentCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_segment(
        &self,
        registry: &Registry,
        key: &(String, i32),
    ) -> Result<Vec<SupplierGauge>> {
        let labels = [
            ("hostname", key.0.clone()),
            ("dbid", key.1.to_string()),
        ];

        let status = SupplierGauge::new(
            "greengage_cluster_segment_status",
            "Segment status: 1 up, 0 down",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| status_value(v.status.as_deref())),
        )?
        .register(registry)?;

        let role = SupplierGauge::new(
            "greengage_cluster_segment_role",
            "Segment role: 1 primary, 2 mirror",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| role_value(v.role.as_deref())),
        )?
        .register(registry)?;

        let mode = SupplierGauge::new(
            "greengage_cluster_segment_mode",
            "Segment mode: 1 synced, 2 resyncing, 3 change-tracking, 4 not syncing",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| mode_value(v.mode.as_deref())),
        )?
        .register(registry)?;

        Ok(vec![status, role, mode])
    }
}

impl Collector for SegmentCollector {
    fn name(&self) -> &'static str {
        "segments"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        let _total = SupplierGauge::new(
            "greengage_cluster_segments_total",
            "Number of segments in the cluster configuration",
            &[],
            self.store.aggregate_supplier(|m| count_f64(m.len())),
        )?
        .register(registry)?;

        let _up = SupplierGauge::new(
            "greengage_cluster_segments_up",
            "Number of segments reporting status up",
            &[],
            self.store.aggregate_supplier(|m| {
                count_f64(
                    m.values()
                        .filter(|v| v.status.as_deref() == Some("u"))
                        .count(),
                )
            }),
        )?
        .register(registry)?;

        let _down = SupplierGauge::new(
            "greengage_cluster_segments_down",
            "Number of segments not reporting status up",
            &[],
            self.store.aggregate_supplier(|m| {
                count_f64(
                    m.values()
                        .filter(|v| v.status.as_deref() != Some("u"))
                        .count(),
                )
            }),
        )?
        .register(registry)?;

        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("segment collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, _version), level = "debug", err, fields(collector = "segments"))]
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
                "SELECT hostname,
                        dbid::int4 AS dbid,
                        role::text AS role,
                        mode::text AS mode,
                        status::text AS status
                 FROM gp_segment_configuration
                 ORDER BY dbid",
            )
            .fetch_all(pool)
            .await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let hostname: String = row.try_get("hostname")?;
                let dbid: i32 = row.try_get("dbid")?;
                entities.insert(
                    (hostname, dbid),
                    SegmentRow {
                        status: row.try_get("status")?,
                        role: row.try_get("role")?,
                        mode: row.try_get("mode")?,
                    },
                );
            }

            self.store
                .apply(registry, entities, |registry, key| {
                    self.register_segment(registry, key)
                })
        })
    }
}
