use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::monitor::{CycleReport, MonitorOrchestrator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub completed_cycles: u64,
    pub interrupted_cycles: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_ms: u64,
    pub uptime_seconds: u64,
}

/// Runs monitoring cycles back to back on a fixed interval.
///
/// A cycle always finishes before the next tick is taken; a cycle that
/// overruns the interval pushes the following tick back instead of stacking.
pub struct MonitorScheduler {
    monitor: MonitorOrchestrator,
    interval: Duration,
    start_time: DateTime<Utc>,
    completed_cycles: u64,
    interrupted_cycles: u64,
    last_run: Option<DateTime<Utc>>,
    last_run_ms: u64,
}

impl MonitorScheduler {
    pub fn new(monitor: MonitorOrchestrator, interval: Duration) -> Self {
        Self {
            monitor,
            interval,
            start_time: Utc::now(),
            completed_cycles: 0,
            interrupted_cycles: 0,
            last_run: None,
            last_run_ms: 0,
        }
    }

    pub fn from_minutes(monitor: MonitorOrchestrator, minutes: u64) -> Self {
        Self::new(monitor, Duration::from_secs(minutes.max(1) * 60))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn monitor(&self) -> &MonitorOrchestrator {
        &self.monitor
    }

    pub async fn run_once(&mut self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let started = tokio::time::Instant::now();
        self.last_run = Some(Utc::now());

        let report = self.monitor.run_cycle(shutdown).await;

        self.last_run_ms = started.elapsed().as_millis() as u64;
        if report.interrupted {
            self.interrupted_cycles += 1;
        } else {
            self.completed_cycles += 1;
        }
        tracing::debug!(duration_ms = self.last_run_ms, "Cycle finished");
        report
    }

    /// Ticks until `shutdown` flips to true or its sender goes away, then
    /// releases the browser session.
    pub async fn run_forever(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            queries = self.monitor.queries().len(),
            "Monitor scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }
            self.run_once(&shutdown).await;
        }

        tracing::info!("Monitor scheduler stopping");
        self.monitor.shutdown().await;
    }

    pub fn stats(&self) -> SchedulerStats {
        let uptime = Utc::now().signed_duration_since(self.start_time);
        SchedulerStats {
            completed_cycles: self.completed_cycles,
            interrupted_cycles: self.interrupted_cycles,
            last_run: self.last_run,
            last_run_ms: self.last_run_ms,
            uptime_seconds: uptime.num_seconds().max(0) as u64,
        }
    }
}
