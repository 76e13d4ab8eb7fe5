//! Server version detection.
//!
//! The version string is fetched once, parsed, and cached for the lifetime of
//! the process; every scrape reads the cached value to pick v6 vs v7 SQL
//! variants. Detection is wrapped in bounded retries with a per-attempt
//! timeout and a small circuit breaker so a down cluster cannot pin the
//! scrape loop inside `SELECT version()`.

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::OnceCell;
use regex::Regex;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Matches the parenthesized product clause of the server banner, e.g.
/// `PostgreSQL 9.4.26 (Greengage Database 6.27.1 build commit:c32bfe) on x86_64 ...`.
static VERSION_RE: OnceCell<Regex> = OnceCell::new();

#[allow(clippy::unwrap_used)] // literal pattern, covered by tests
fn version_regex() -> &'static Regex {
    VERSION_RE.get_or_init(|| {
        Regex::new(r"\(\s*[A-Za-z][A-Za-z ]*?\s(\d+)\.(\d+)\.(\d+)\S*\s+build\s+\S+").unwrap()
    })
}

/// Parsed server version, plus the raw banner for the cluster-state label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub raw: String,
}

impl Version {
    /// Parse the product version out of a `SELECT version()` banner.
    ///
    /// # Errors
    ///
    /// Returns an error when the banner does not carry a recognizable
    /// `( <product> M.m.p build <x> )` clause.
    pub fn parse(raw: &str) -> Result<Self> {
        let caps = version_regex()
            .captures(raw)
            .ok_or_else(|| anyhow!("unrecognized server version banner: {raw:?}"))?;

        let field = |i: usize| -> Result<u32> {
            caps.get(i)
                .ok_or_else(|| anyhow!("missing capture {i}"))?
                .as_str()
                .parse::<u32>()
                .context("non-numeric version component")
        };

        Ok(Self {
            major: field(1)?,
            minor: field(2)?,
            patch: field(3)?,
            raw: raw.to_string(),
        })
    }

    #[must_use]
    pub const fn is_at_least_v7(&self) -> bool {
        self.major >= 7
    }

    #[must_use]
    pub const fn is_supported(&self) -> bool {
        self.major >= 6
    }

    #[must_use]
    pub fn short(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Detection tuning; the defaults keep a cold probe under a few seconds.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub attempts: u32,
    pub backoff: Duration,
    pub attempt_timeout: Duration,
    /// Consecutive failed probe calls before the breaker opens.
    pub breaker_threshold: u32,
    /// How long the breaker stays open once tripped.
    pub breaker_open: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
            attempt_timeout: Duration::from_secs(3),
            breaker_threshold: 4,
            breaker_open: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// One-shot, retrying version probe.
///
/// The cached value is set once and read lock-free afterwards; only the slow
/// path (cache miss) serializes behind the async mutex.
pub struct VersionProbe {
    cached: OnceCell<Version>,
    breaker: tokio::sync::Mutex<BreakerState>,
    cfg: ProbeConfig,
}

impl Default for VersionProbe {
    fn default() -> Self {
        Self::new(ProbeConfig::default())
    }
}

impl VersionProbe {
    #[must_use]
    pub const fn new(cfg: ProbeConfig) -> Self {
        Self {
            cached: OnceCell::new(),
            breaker: tokio::sync::Mutex::const_new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
            cfg,
        }
    }

    /// The cached version, if detection has succeeded before.
    #[must_use]
    pub fn cached(&self) -> Option<&Version> {
        self.cached.get()
    }

    /// Return the cached version, detecting it on first call.
    ///
    /// # Errors
    ///
    /// Returns an error when all attempts fail, when the breaker is open, or
    /// when the banner cannot be parsed. Callers treat an error as "version
    /// undetermined, retry on next scrape".
    pub async fn version(&self, pool: &PgPool) -> Result<Version> {
        if let Some(v) = self.cached.get() {
            return Ok(v.clone());
        }

        let mut state = self.breaker.lock().await;

        // Another task may have completed detection while we waited.
        if let Some(v) = self.cached.get() {
            return Ok(v.clone());
        }

        if let Some(until) = state.open_until {
            if Instant::now() < until {
                bail!("version detection suspended until {until:?}");
            }
            state.open_until = None;
        }

        match self.detect(pool).await {
            Ok(version) => {
                state.consecutive_failures = 0;
                debug!(version = %version.short(), "detected server version");
                let _ = self.cached.set(version.clone());
                Ok(version)
            }
            Err(e) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.cfg.breaker_threshold {
                    state.open_until = Some(Instant::now() + self.cfg.breaker_open);
                    state.consecutive_failures = 0;
                    warn!(
                        open_for = ?self.cfg.breaker_open,
                        "version detection failing repeatedly, opening breaker"
                    );
                }
                Err(e)
            }
        }
    }

    async fn detect(&self, pool: &PgPool) -> Result<Version> {
        let mut last_err = anyhow!("version detection not attempted");

        for attempt in 1..=self.cfg.attempts {
            let fetch = sqlx::query_scalar::<_, String>("SELECT version()").fetch_one(pool);

            match timeout(self.cfg.attempt_timeout, fetch).await {
                Ok(Ok(banner)) => {
                    // A parse failure will not heal on retry; surface it now.
                    return Version::parse(&banner);
                }
                Ok(Err(e)) => {
                    last_err = anyhow!(e).context("SELECT version() failed");
                }
                Err(_) => {
                    last_err = anyhow!("SELECT version() timed out");
                }
            }

            if attempt < self.cfg.attempts {
                sleep(self.cfg.backoff).await;
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const GG6: &str = "PostgreSQL 9.4.26 (Greengage Database 6.27.1 build commit:c32bfe1) \
                       on x86_64-unknown-linux-gnu, compiled by gcc, 64-bit";
    const GG7: &str = "PostgreSQL 12.12 (Greengage Database 7.1.0+dev.12 build commit:9ab2df0) \
                       on x86_64-unknown-linux-gnu, compiled by gcc, 64-bit";
    const GP6: &str = "PostgreSQL 9.4.24 (Greenplum Database 6.19.0 build commit:abcdef01) \
                       on x86_64-pc-linux-gnu";

    #[test]
    fn test_parse_v6() {
        let v = Version::parse(GG6).unwrap();
        assert_eq!((v.major, v.minor, v.patch), (6, 27, 1));
        assert!(!v.is_at_least_v7());
        assert!(v.is_supported());
        assert_eq!(v.short(), "6.27.1");
        assert_eq!(v.raw, GG6);
    }

    #[test]
    fn test_parse_v7_with_suffix() {
        let v = Version::parse(GG7).unwrap();
        assert_eq!((v.major, v.minor, v.patch), (7, 1, 0));
        assert!(v.is_at_least_v7());
    }

    #[test]
    fn test_parse_greenplum_banner() {
        let v = Version::parse(GP6).unwrap();
        assert_eq!((v.major, v.minor, v.patch), (6, 19, 0));
    }

    #[test]
    fn test_parse_rejects_plain_postgres() {
        // No product clause with a build marker.
        assert!(Version::parse("PostgreSQL 14.2 on x86_64-pc-linux-gnu").is_err());
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn test_unsupported_major() {
        let v = Version {
            major: 5,
            minor: 28,
            patch: 12,
            raw: String::new(),
        };
        assert!(!v.is_supported());
        assert!(!v.is_at_least_v7());
    }

    #[tokio::test]
    async fn test_probe_returns_cached_without_touching_pool() {
        let probe = VersionProbe::default();
        let _ = probe.cached.set(Version::parse(GG6).unwrap());

        // A lazy pool with nothing listening: any query would fail, so a
        // successful return proves the cache path.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://nobody@127.0.0.1:1/none")
            .unwrap();

        let v = probe.version(&pool).await.unwrap();
        assert_eq!(v.short(), "6.27.1");
    }

    #[tokio::test]
    async fn test_probe_breaker_opens_after_repeated_failures() {
        let probe = VersionProbe::new(ProbeConfig {
            attempts: 1,
            backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
            breaker_threshold: 2,
            breaker_open: Duration::from_secs(60),
        });

        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("postgres://nobody@127.0.0.1:1/none")
            .unwrap();

        assert!(probe.version(&pool).await.is_err());
        assert!(probe.version(&pool).await.is_err());

        // Breaker is now open: the error must come back without a DB round trip.
        let started = Instant::now();
        let err = probe.version(&pool).await.unwrap_err();
        assert!(err.to_string().contains("suspended"));
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
