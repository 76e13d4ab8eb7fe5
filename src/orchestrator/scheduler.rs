//! Periodic scrape driver.
//!
//! Ticks are skipped while a scrape is still running (the orchestrator's
//! non-blocking lock handles the race with external triggers), and nothing
//! escapes the loop: a failed scrape is logged and the ticker keeps going.

use crate::orchestrator::{Orchestrator, ScrapeOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub fn spawn(orchestrator: Arc<Orchestrator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period = ?period, "scrape scheduler started");

        loop {
            ticker.tick().await;
            match orchestrator.scrape().await {
                ScrapeOutcome::Completed(result) if !result.success => {
                    warn!(
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "scheduled scrape failed"
                    );
                }
                outcome => debug!(outcome = ?outcome, "scheduled scrape finished"),
            }
        }
    })
}
