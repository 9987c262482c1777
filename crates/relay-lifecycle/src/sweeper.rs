//! Periodic timeout sweep.
//!
//! Every tick runs two duties in order: hard expiry of overdue pending
//! requests, then the advisory warning pass. At most one sweep executes at
//! a time; a tick that cannot take the slot is skipped outright, never
//! queued. Duty failures are logged and do not stop the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_core::current_unix_timestamp_ms;

use crate::RequestService;

/// Tuning for the sweep loop.
#[derive(Debug, Clone)]
pub struct TimeoutSweeperConfig {
    pub period: Duration,
}

impl Default for TimeoutSweeperConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(300),
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub warned: usize,
    pub skipped: bool,
    pub failed: bool,
}

/// Recurring sweep over pending requests.
pub struct TimeoutSweeper {
    service: Arc<RequestService>,
    config: TimeoutSweeperConfig,
    running: AtomicBool,
}

impl TimeoutSweeper {
    pub fn new(service: Arc<RequestService>, config: TimeoutSweeperConfig) -> Arc<Self> {
        Arc::new(Self {
            service,
            config,
            running: AtomicBool::new(false),
        })
    }

    /// Runs the sweep loop until shutdown is requested.
    pub async fn run(self: Arc<Self>) {
        println!(
            "timeout sweeper started: period_seconds={}",
            self.config.period.as_secs()
        );
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("timeout sweeper shutdown requested");
                    return;
                }
                _ = tokio::time::sleep(self.config.period) => {}
            }

            let report = self.tick(current_unix_timestamp_ms()).await;
            if report.timed_out > 0 || report.warned > 0 || report.failed {
                println!(
                    "timeout sweep: timed_out={} warnings={} failed={}",
                    report.timed_out, report.warned, report.failed
                );
            }
        }
    }

    /// One sweep pass. Single-slot take: if a previous sweep still holds
    /// the slot, this tick returns immediately as skipped.
    pub async fn tick(&self, now_unix_ms: u64) -> SweepReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            println!("timeout sweep already running, skipping tick");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        }

        let report = self.sweep_once(now_unix_ms).await;
        self.running.store(false, Ordering::SeqCst);
        report
    }

    async fn sweep_once(&self, now_unix_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();

        match self.service.check_timeouts(now_unix_ms).await {
            Ok(timed_out) => report.timed_out = timed_out,
            Err(error) => {
                eprintln!("timeout sweep failed during expiry pass: {error}");
                report.failed = true;
                return report;
            }
        }

        match self.service.send_timeout_warnings(now_unix_ms).await {
            Ok(warned) => report.warned = warned,
            Err(error) => {
                eprintln!("timeout sweep failed during warning pass: {error}");
                report.failed = true;
            }
        }

        report
    }
}
