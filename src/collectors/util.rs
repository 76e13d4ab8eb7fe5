//! Shared collector helpers: the numeric encodings of categorical states
//! (part of the external metric contract, do not change), skew rollups, and
//! process-wide collector tunables set once at startup.

use once_cell::sync::OnceCell;

/// Segment status: `u` up, `d` down.
#[must_use]
pub fn status_value(status: Option<&str>) -> f64 {
    match status {
        Some("u") => 1.0,
        _ => 0.0,
    }
}

/// Segment role: `p` primary, everything else mirror.
#[must_use]
pub fn role_value(role: Option<&str>) -> f64 {
    match role {
        Some("p") => 1.0,
        _ => 2.0,
    }
}

/// Replication mode of a segment: synced, resyncing, change-tracking, none.
#[must_use]
pub fn mode_value(mode: Option<&str>) -> f64 {
    match mode {
        Some("s") => 1.0,
        Some("r") => 2.0,
        Some("c") => 3.0,
        None | Some("n") => 4.0,
        Some(_) => 0.0,
    }
}

/// WAL sender state.
#[must_use]
pub fn replication_state_value(state: Option<&str>) -> f64 {
    match state {
        Some("streaming") => 1.0,
        Some("catchup") => 2.0,
        Some("backup") => 3.0,
        _ => 0.0,
    }
}

/// WAL sender sync state.
#[must_use]
pub fn sync_state_value(state: Option<&str>) -> f64 {
    match state {
        Some("sync") => 2.0,
        Some("async") => 1.0,
        Some("potential") => 0.5,
        _ => 0.0,
    }
}

/// Bloat severity from actual vs expected page counts: 0 none, 1 moderate,
/// 2 severe.
#[must_use]
pub fn bloat_state(pages: f64, expected_pages: f64) -> f64 {
    if expected_pages <= 0.0 || pages <= 0.0 {
        return 0.0;
    }
    let ratio = pages / expected_pages;
    if ratio >= 10.0 {
        2.0
    } else if ratio >= 3.0 {
        1.0
    } else {
        0.0
    }
}

/// `max / avg` over per-host samples; 1.0 means balanced. Empty input or a
/// zero average reads 0.0.
#[must_use]
pub fn skew_ratio<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut max = f64::MIN;
    let mut sum = 0.0;
    let mut count = 0_u32;
    for v in values {
        max = max.max(v);
        sum += v;
        count += 1;
    }
    if count == 0 || sum <= 0.0 {
        return 0.0;
    }
    max / (sum / f64::from(count))
}

/// Entity counts exposed as gauge values.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn count_f64(n: usize) -> f64 {
    n as f64
}

/// Wide-integer SQL values exposed as gauge values.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn i64_f64(n: i64) -> f64 {
    n as f64
}

/// Canonical stand-in for absent user-visible text values.
pub const UNKNOWN: &str = "unknown";

#[must_use]
pub fn text_or_unknown(value: Option<String>) -> String {
    match value {
        Some(s) if !s.trim().is_empty() => s,
        _ => UNKNOWN.to_string(),
    }
}

/// Collector tunables that cannot travel through the zero-argument factory
/// functions; set once during startup, before the first scrape.
#[derive(Clone, Debug)]
pub struct Tunables {
    /// Minimum live-tuple count for a table to appear in vacuum statistics.
    pub table_vacuum_tuple_threshold: i64,
    /// SQLite URL or path of the gpbackup history file.
    pub backup_history_url: Option<String>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            table_vacuum_tuple_threshold: 1000,
            backup_history_url: None,
        }
    }
}

static TUNABLES: OnceCell<Tunables> = OnceCell::new();

/// Install the tunables. Later calls are ignored; call once during startup.
pub fn set_tunables(tunables: Tunables) {
    let _ = TUNABLES.set(tunables);
}

/// The installed tunables, or the defaults when nothing was installed (tests).
#[must_use]
pub fn tunables() -> Tunables {
    TUNABLES.get().cloned().unwrap_or_default()
}
