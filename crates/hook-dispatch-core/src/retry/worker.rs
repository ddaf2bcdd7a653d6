//! Background consumer for the retry queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::RetryPipeline;

/// Polls the retry store and re-dispatches due entries until shut down.
///
/// Several workers may share one pipeline; the store's leasing keeps them from
/// picking up the same entry.
#[derive(Debug, Clone)]
pub struct RetryWorker {
    pipeline: Arc<RetryPipeline>,
    poll_interval: Duration,
    batch_size: usize,
}

impl RetryWorker {
    pub fn new(pipeline: Arc<RetryPipeline>, poll_interval: Duration, batch_size: usize) -> Self {
        Self {
            pipeline,
            poll_interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// A sweep that is still dispatching when shutdown arrives sees its
    /// handlers cancelled; their entries are rescheduled as failures.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Retry worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping retry worker");
                    break;
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    self.sweep(&shutdown).await;
                }
            }
        }
    }

    /// Process due entries until fewer than a full batch is returned.
    async fn sweep(&self, shutdown: &CancellationToken) {
        loop {
            let report = match self
                .pipeline
                .process_due(Utc::now(), self.batch_size, shutdown)
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Retry sweep failed");
                    return;
                }
            };

            if report.processed() > 0 || report.errored > 0 {
                info!(
                    succeeded = report.succeeded,
                    rescheduled = report.rescheduled,
                    dead_lettered = report.dead_lettered,
                    errored = report.errored,
                    "Retry sweep finished"
                );
            } else {
                debug!("No retry entries due");
            }

            if report.processed() < self.batch_size || shutdown.is_cancelled() {
                return;
            }
        }
    }
}
