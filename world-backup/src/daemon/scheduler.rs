//! Periodic and single-shot backup scheduling.
//!
//! Ticks run on the scheduler's own task, one after another. Cancellation is
//! only observed between ticks: a tick that has started always finishes.

use crate::config::MAX_INTERVAL_MINUTES;
use crate::executor::{Backup, BackupJob};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Scheduler<B> {
    backup: B,
    interval: Duration,
}

impl<B: Backup> Scheduler<B> {
    /// The interval is clamped to between one second and the longest
    /// configurable interval.
    pub fn new(backup: B, interval: Duration) -> Self {
        let interval = interval.clamp(
            Duration::from_secs(1),
            Duration::from_secs(MAX_INTERVAL_MINUTES * 60),
        );
        Self { backup, interval }
    }

    /// Run exactly one tick.
    pub async fn run_once(&self) -> BackupJob {
        info!("Running a single backup");
        self.backup.run_tick().await
    }

    /// Run one tick per interval until `cancel` fires. Returns the number
    /// of ticks run.
    ///
    /// The first tick happens one interval after the call. When a tick
    /// overruns, one missed firing runs right after it and any others are
    /// dropped.
    pub async fn run(&self, cancel: CancellationToken) -> usize {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Backing up every {} minutes",
            self.interval.as_secs_f64() / 60.0
        );

        let mut ticks = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Backup scheduler stopped after {} ticks", ticks);
                    break;
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    let job = self.backup.run_tick().await;
                    debug!(job_id = %job.id, "Tick {} finished in state {:?}", ticks, job.state);
                }
            }
        }

        ticks
    }
}
