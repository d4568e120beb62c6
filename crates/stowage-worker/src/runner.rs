//! Worker runner: the daemon loop that invokes transfers and periodic jobs.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use stowage_core::config::WorkerConfig;

use crate::executor::JobExecutor;
use crate::transfer::TransferWorker;

/// Main loop. One transfer invocation per poll interval, then any
/// periodic job that is due.
#[derive(Debug)]
pub struct WorkerRunner {
    /// Advances package transfers.
    transfer: TransferWorker,
    /// Periodic maintenance jobs.
    executor: JobExecutor,
    /// Worker configuration
    config: WorkerConfig,
    /// Worker identifier
    worker_id: String,
}

impl WorkerRunner {
    /// Create a new worker runner
    pub fn new(
        transfer: TransferWorker,
        executor: JobExecutor,
        config: WorkerConfig,
        worker_id: String,
    ) -> Self {
        Self {
            transfer,
            executor,
            config,
            worker_id,
        }
    }

    /// Start the worker runner. Runs until the cancel signal is received.
    ///
    /// A transfer invocation in flight is allowed to finish its current
    /// time slice; the slice is bounded, so shutdown is too.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        if !self.config.enabled {
            tracing::info!(worker = %self.worker_id, "Worker disabled by configuration");
            return;
        }
        tracing::info!(
            worker = %self.worker_id,
            poll_interval_secs = self.config.poll_interval_seconds,
            sweep_interval_secs = self.config.sweep_interval_seconds,
            "Worker started"
        );

        let poll_interval = Duration::from_secs(self.config.poll_interval_seconds);
        loop {
            if *cancel.borrow() {
                break;
            }
            self.tick().await;

            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        tracing::info!(worker = %self.worker_id, "Worker received shutdown signal");
                        break;
                    }
                }
                _ = time::sleep(poll_interval) => {}
            }
        }

        tracing::info!(worker = %self.worker_id, "Worker shut down complete");
    }

    /// One iteration: a transfer invocation, then due jobs.
    pub async fn tick(&mut self) {
        match self.transfer.run_pending().await {
            Ok(reports) => {
                for report in reports.iter().filter(|r| !r.steps.is_empty()) {
                    tracing::info!(
                        package_id = report.package_id,
                        steps = report.steps.len(),
                        skipped = report.skipped.len(),
                        status = %report.status,
                        "Transfer invocation finished"
                    );
                }
            }
            Err(e) => tracing::error!(worker = %self.worker_id, error = %e, "Transfer invocation failed"),
        }
        self.executor.run_due().await;
    }
}
