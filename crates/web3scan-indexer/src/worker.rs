use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use web3scan_common::ScanError;

use crate::abi::{InterfaceRegistry, TrackedContract};
use crate::decoder::decode_log;
use crate::fetcher::{EndpointPool, RetryPolicy, SharedRateLimiter};
use crate::types::{DecodedEvent, FailedJob, JobOutcome, ScanJob, ScanResult};

/// Long-lived fetch worker.
///
/// Pulls jobs from the shared queue, fetches and decodes the logs of each
/// range and reports exactly one [`JobOutcome`] per job, even when the range
/// has no matching logs. Exits when the job queue is closed and drained, when
/// the result channel is gone, or on cancellation.
pub struct Worker {
    pub id: usize,
    pub jobs: async_channel::Receiver<ScanJob>,
    pub results: mpsc::Sender<JobOutcome>,
    pub endpoints: EndpointPool,
    pub registry: Arc<InterfaceRegistry>,
    pub limiter: SharedRateLimiter,
    pub retry: RetryPolicy,
    /// Pause after every job
    pub cooldown: Duration,
    pub cancel: CancellationToken,
}

impl Worker {
    pub async fn run(self) {
        tracing::debug!("Worker {} started", self.id);

        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Ok(job) => job,
                    // Channel closed and empty
                    Err(_) => break,
                },
            };

            let Some(outcome) = self.execute(job).await else {
                break;
            };

            if self.results.send(outcome).await.is_err() {
                tracing::debug!("Worker {}: result channel closed", self.id);
                break;
            }

            if !self.cooldown.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.cooldown) => {}
                }
            }
        }

        tracing::debug!("Worker {} shutting down", self.id);
    }

    /// Fetch and decode one job, retrying transient failures with backoff.
    ///
    /// Every attempt picks a fresh endpoint. Returns `None` when the run is
    /// cancelled during a fetch or a backoff; the job then has no outcome and
    /// its range stays uncommitted.
    pub async fn execute(&self, job: ScanJob) -> Option<JobOutcome> {
        let Some(contract) = self.registry.get(&job.contract) else {
            return Some(self.fail(job, format!("contract {:?} is not tracked", job.contract), 0));
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let scanned = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                scanned = self.scan(contract, &job) => scanned,
            };

            match scanned {
                Ok(events) => {
                    metrics::counter!("web3scan_jobs_completed_total").increment(1);
                    metrics::counter!("web3scan_events_decoded_total").increment(events.len() as u64);
                    tracing::debug!(
                        "Worker {}: {:?} blocks {}-{} (job {}) yielded {} events",
                        self.id,
                        job.contract,
                        job.start_block,
                        job.end_block,
                        job.index,
                        events.len()
                    );

                    return Some(JobOutcome::Completed(ScanResult {
                        contract: job.contract,
                        index: job.index,
                        start_block: job.start_block,
                        end_block: job.end_block,
                        events,
                    }));
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay(attempt - 1);
                    metrics::counter!("web3scan_fetch_retries_total").increment(1);
                    tracing::warn!(
                        "Worker {}: job {} for {:?} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        self.id,
                        job.index,
                        job.contract,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Some(self.fail(job, e.to_string(), attempt)),
            }
        }
    }

    async fn scan(&self, contract: &TrackedContract, job: &ScanJob) -> Result<Vec<DecodedEvent>, ScanError> {
        self.limiter.until_ready().await;

        let source = self.endpoints.pick();
        let mut logs = source
            .fetch_logs(job.contract, job.start_block, job.end_block, &contract.topics)
            .await
            .map_err(|e| match e {
                ScanError::Rpc(msg) => ScanError::Rpc(format!("{}: {}", source.endpoint(), msg)),
                other => other,
            })?;

        logs.sort_by_key(|log| (log.block_number, log.log_index));

        logs.iter()
            .map(|log| decode_log(job.contract, &contract.interface, log))
            .collect()
    }

    fn fail(&self, job: ScanJob, reason: String, attempts: u32) -> JobOutcome {
        metrics::counter!("web3scan_jobs_failed_total").increment(1);
        tracing::error!(
            "Worker {}: giving up on job {} for {:?} (blocks {}-{}) after {} attempts: {}",
            self.id,
            job.index,
            job.contract,
            job.start_block,
            job.end_block,
            attempts,
            reason
        );

        JobOutcome::Failed(FailedJob { job, reason, attempts })
    }
}
