use crate::collectors::Collector;
use crate::collectors::util::{replication_state_value, sync_state_value, text_or_unknown};
use crate::collectors::entity::EntityStore;
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

// The WAL introspection surface was renamed between the v6 (xlog/location)
// and v7 (wal/lsn) line; everything else is shared.
const REPLICATION_SQL_V6: &str = "\
    SELECT gp_segment_id::int4 AS segment_id,
           COALESCE(client_hostname, client_addr::text) AS hostname,
           state,
           sync_state,
           pg_xlog_location_diff(pg_current_xlog_location(), sent_location)::float8 AS sent_lag,
           pg_xlog_location_diff(pg_current_xlog_location(), flush_location)::float8 AS flush_lag,
           pg_xlog_location_diff(pg_current_xlog_location(), replay_location)::float8 AS replay_lag
    FROM gp_stat_replication";

const REPLICATION_SQL_V7: &str = "\
    SELECT gp_segment_id::int4 AS segment_id,
           COALESCE(client_hostname, client_addr::text) AS hostname,
           state,
           sync_state,
           pg_wal_lsn_diff(pg_current_wal_lsn(), sent_lsn)::float8 AS sent_lag,
           pg_wal_lsn_diff(pg_current_wal_lsn(), flush_lsn)::float8 AS flush_lag,
           pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn)::float8 AS replay_lag
    FROM gp_stat_replication";

#[derive(Clone, Debug)]
pub struct ReplicationRow {
    pub state: Option<String>,
    pub sync_state: Option<String>,
    pub sent_lag: Option<f64>,
    pub flush_lag: Option<f64>,
    pub replay_lag: Option<f64>,
}

/// WAL replication status per `(segment, peer)`: mirror and standby walsender
/// state, sync mode, and byte lag at the sent/flush/replay stages.
#[derive(Clone)]
pub struct ReplicationCollector {
    store: Arc<EntityStore<(i32, String), ReplicationRow>>,
    registry: Arc<OnceCell<Registry>>,
}

impl Default for ReplicationCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(EntityStore::new(false)),
            registry: Arc::new(OnceCell::new()),
        }
    }

    fn register_peer(
        &self,
        registry: &Registry,
        key: &(i32, String),
    ) -> Result<Vec<SupplierGauge>> {
        let labels = [
            ("gp_segment_id", key.0.to_string()),
            ("hostname", key.1.clone()),
        ];

        let state = SupplierGauge::new(
            "greengage_cluster_replication_state",
            "WAL sender state: 1 streaming, 2 catchup, 3 backup, 0 other",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| replication_state_value(v.state.as_deref())),
        )?
        .register(registry)?;

        let sync = SupplierGauge::new(
            "greengage_cluster_replication_sync_state",
            "WAL sender sync state: 2 sync, 1 async, 0.5 potential, 0 other",
            &labels,
            self.store
                .value_supplier(key.clone(), |v| sync_state_value(v.sync_state.as_deref())),
        )?
        .register(registry)?;

        let mut gauges = vec![state, sync];
        let lag_gauges: [(&str, &str, fn(&ReplicationRow) -> f64); 3] = [
            (
                "greengage_cluster_replication_sent_lag_bytes",
                "Bytes the peer trails behind the current WAL write position",
                |v| v.sent_lag.unwrap_or(f64::NAN),
            ),
            (
                "greengage_cluster_replication_flush_lag_bytes",
                "Bytes sent to the peer but not yet flushed there",
                |v| v.flush_lag.unwrap_or(f64::NAN),
            ),
            (
                "greengage_cluster_replication_replay_lag_bytes",
                "Bytes flushed on the peer but not yet replayed",
                |v| v.replay_lag.unwrap_or(f64::NAN),
            ),
        ];
        for (name, help, read) in lag_gauges {
            gauges.push(
                SupplierGauge::new(
                    name,
                    help,
                    &labels,
                    self.store.value_supplier(key.clone(), read),
                )?
                .register(registry)?,
            );
        }

        Ok(gauges)
    }
}

impl Collector for ReplicationCollector {
    fn name(&self) -> &'static str {
        "replication"
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.registry
            .set(registry.clone())
            .map_err(|_| anyhow!("replication collector registered twice"))?;
        Ok(())
    }

    #[instrument(skip(self, pool, version), level = "debug", err, fields(collector = "replication"))]
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
                REPLICATION_SQL_V7
            } else {
                REPLICATION_SQL_V6
            };

            let rows = sqlx::query(sql).fetch_all(pool).await?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in &rows {
                let segment_id: i32 = row.try_get("segment_id")?;
                let hostname = text_or_unknown(row.try_get("hostname")?);
                entities.insert(
                    (segment_id, hostname),
                    ReplicationRow {
                        state: row.try_get("state")?,
                        sync_state: row.try_get("sync_state")?,
                        sent_lag: row.try_get("sent_lag")?,
                        flush_lag: row.try_get("flush_lag")?,
                        replay_lag: row.try_get("replay_lag")?,
                    },
                );
            }

            self.store.apply(registry, entities, |registry, key| {
                self.register_peer(registry, key)
            })
        })
    }

    fn fail_on_error(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_metrics_use_contract_encodings() {
        let collector = ReplicationCollector::new();
        let registry = Registry::new();
        collector.register_metrics(&registry).unwrap();

        let entities: HashMap<(i32, String), ReplicationRow> = [(
            (0, "sdw1".to_string()),
            ReplicationRow {
                state: Some("streaming".into()),
                sync_state: Some("sync".into()),
                sent_lag: Some(128.0),
                flush_lag: Some(256.0),
                replay_lag: None,
            },
        )]
        .into();

        collector
            .store
            .apply(&registry, entities, |r, k| collector.register_peer(r, k))
            .unwrap();

        let key = (0, "sdw1".to_string());
        let state = collector
            .store
            .value_supplier(key.clone(), |v| replication_state_value(v.state.as_deref()));
        assert_eq!(state(), 1.0);

        let sync = collector
            .store
            .value_supplier(key.clone(), |v| sync_state_value(v.sync_state.as_deref()));
        assert_eq!(sync(), 2.0);

        let replay = collector
            .store
            .value_supplier(key, |v| v.replay_lag.unwrap_or(f64::NAN));
        assert!(replay().is_nan());
    }

    #[test]
    fn test_sql_variants_differ_only_in_wal_functions() {
        assert!(REPLICATION_SQL_V6.contains("pg_xlog_location_diff"));
        assert!(REPLICATION_SQL_V7.contains("pg_wal_lsn_diff"));
        assert!(!REPLICATION_SQL_V7.contains("xlog"));
    }
}
