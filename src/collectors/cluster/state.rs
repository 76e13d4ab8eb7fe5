use crate::collectors::Collector;
use crate::collectors::util::text_or_unknown;
use crate::db::Version;
use anyhow::Result;
use futures::future::BoxFuture;
use prometheus::{IntGaugeVec, Opts, Registry};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

/// Cluster identity beacon: a constant `1` carrying the detected version and
/// the coordinator/standby hostnames as labels. The labels are re-read every
/// scrape so a failover or upgrade shows up without an exporter restart.
#[derive(Clone)]
pub struct ClusterStateCollector {
    state: IntGaugeVec,
}

impl Default for ClusterStateCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateCollector {
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let state = IntGaugeVec::new(
            Opts::new(
                "greengage_cluster_state",
                "Constant 1, labelled with version and coordinator topology",
            ),
            &["version", "master", "standby"],
        )
        .expect("greengage_cluster_state");

        Self { state }
    }
}

impl Collector for ClusterStateCollector {
    fn name(&self) -> &'static str {
        "cluster_state"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.state.clone()))?;
        Ok(())
    }

    #[instrument(skip(self, pool, version), level = "debug", err, fields(collector = "cluster_state"))]
    fn collect<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a Version,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT role::text AS role, hostname
                 FROM gp_segment_configuration
                 WHERE content = -1",
            )
            .fetch_all(pool)
            .await?;

            let mut master = None;
            let mut standby = None;
            for row in &rows {
                let role: Option<String> = row.try_get("role")?;
                let hostname: Option<String> = row.try_get("hostname")?;
                match role.as_deref() {
                    Some("p") => master = hostname,
                    Some("m") => standby = hostname,
                    _ => {}
                }
            }

            let master = text_or_unknown(master);
            let standby = text_or_unknown(standby);

            // Old label combinations (pre-failover) must not linger.
            self.state.reset();
            self.state
                .with_label_values(&[&version.short(), &master, &standby])
                .set(1);

            debug!(master = %master, standby = %standby, "updated cluster state");
            Ok(())
        })
    }

    fn fail_on_error(&self) -> bool {
        false
    }
}
