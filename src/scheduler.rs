use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::job::{UpdateJobHandle, UpdateReason};

/// Triggers a scheduled update every `interval`, first tick one interval after start.
pub fn spawn_update_scheduler(
    job: UpdateJobHandle,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "periodic updates enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match job.try_start(UpdateReason::Scheduled).await {
                Ok(accepted) => {
                    info!(run_id = %accepted.run_id, "scheduled update started");
                }
                Err(busy) => {
                    warn!(run_id = %busy.run_id, "scheduled update skipped; an update is already running");
                }
            }
        }
    })
}
