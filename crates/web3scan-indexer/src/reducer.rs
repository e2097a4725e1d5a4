use alloy::primitives::Address;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::CommitFailurePolicy;
use crate::handler::EventHandler;
use crate::store::EventStore;
use crate::types::{FailedJob, JobOutcome, ScanResult};

/// Per-contract reorder state
#[derive(Debug, Default)]
struct Sequence {
    /// Index of the next outcome to apply
    next: u64,
    buffer: BTreeMap<u64, JobOutcome>,
}

/// A contract whose reorder buffer was not empty when the result channel closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledContract {
    pub contract: Address,
    /// The index that never arrived
    pub next_index: u64,
    pub buffered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReducerReport {
    pub committed_results: u64,
    pub committed_events: u64,
    pub rolled_back: u64,
    /// Ranges recorded in the skipped ranges table
    pub skipped: u64,
    pub stalled: Vec<StalledContract>,
}

/// Single consumer of job outcomes.
///
/// Workers finish jobs in any order. The reducer buffers outcomes per
/// contract and applies them strictly by job index, one transaction per
/// outcome: the handler and the store see every event of a result, then the
/// contract's checkpoint moves to the result's end block, then the
/// transaction commits. A failed job is recorded as a skipped range without
/// moving the checkpoint.
///
/// Returns when the result channel closes, i.e. once every worker has exited.
pub struct Reducer<S: EventStore, H: EventHandler<S::Tx>> {
    store: Arc<S>,
    handler: Arc<H>,
    results: mpsc::Receiver<JobOutcome>,
    policy: CommitFailurePolicy,
    sequences: HashMap<Address, Sequence>,
    report: ReducerReport,
}

impl<S: EventStore, H: EventHandler<S::Tx>> Reducer<S, H> {
    pub fn new(
        store: Arc<S>,
        handler: Arc<H>,
        results: mpsc::Receiver<JobOutcome>,
        policy: CommitFailurePolicy,
    ) -> Self {
        Self {
            store,
            handler,
            results,
            policy,
            sequences: HashMap::new(),
            report: ReducerReport::default(),
        }
    }

    pub async fn run(mut self) -> Result<ReducerReport> {
        while let Some(outcome) = self.results.recv().await {
            let contract = outcome.contract();
            let index = outcome.index();
            let sequence = self.sequences.entry(contract).or_default();

            if index < sequence.next || sequence.buffer.contains_key(&index) {
                tracing::warn!("Ignoring duplicate outcome {} for {:?}", index, contract);
                continue;
            }
            sequence.buffer.insert(index, outcome);
            metrics::gauge!("web3scan_reorder_buffered").increment(1.0);

            self.drain(contract).await?;
        }

        for (contract, sequence) in &self.sequences {
            if !sequence.buffer.is_empty() {
                tracing::warn!(
                    "{:?}: {} results never committed, job {} did not complete",
                    contract,
                    sequence.buffer.len(),
                    sequence.next
                );
                self.report.stalled.push(StalledContract {
                    contract: *contract,
                    next_index: sequence.next,
                    buffered: sequence.buffer.len(),
                });
            }
        }
        self.report.stalled.sort_by_key(|s| s.contract);

        Ok(self.report)
    }

    /// Apply every consecutive outcome that is ready for `contract`
    async fn drain(&mut self, contract: Address) -> Result<()> {
        loop {
            let Some(sequence) = self.sequences.get_mut(&contract) else {
                return Ok(());
            };
            let Some(outcome) = sequence.buffer.remove(&sequence.next) else {
                return Ok(());
            };
            sequence.next += 1;
            metrics::gauge!("web3scan_reorder_buffered").decrement(1.0);

            match outcome {
                JobOutcome::Completed(result) => self.apply_result(result).await?,
                JobOutcome::Failed(failed) => self.apply_failure(failed).await?,
            }
        }
    }

    async fn apply_result(&mut self, result: ScanResult) -> Result<()> {
        match self.commit_result(&result).await {
            Ok(()) => {
                self.report.committed_results += 1;
                self.report.committed_events += result.events.len() as u64;
                metrics::counter!("web3scan_results_committed_total").increment(1);
                metrics::counter!("web3scan_events_committed_total").increment(result.events.len() as u64);
                tracing::debug!(
                    "Committed job {} for {:?}: blocks {}-{}, {} events",
                    result.index,
                    result.contract,
                    result.start_block,
                    result.end_block,
                    result.events.len()
                );
                Ok(())
            }
            Err(e) => {
                self.report.rolled_back += 1;
                metrics::counter!("web3scan_results_rolled_back_total").increment(1);

                match self.policy {
                    CommitFailurePolicy::Halt => Err(e.context(format!(
                        "Job {} for {:?} (blocks {}-{}) rolled back",
                        result.index, result.contract, result.start_block, result.end_block
                    ))),
                    CommitFailurePolicy::Skip => {
                        tracing::error!(
                            "Job {} for {:?} (blocks {}-{}) rolled back, skipping range: {:#}",
                            result.index,
                            result.contract,
                            result.start_block,
                            result.end_block,
                            e
                        );
                        let reason = format!("rolled back: {:#}", e);
                        self.record_skip(result.contract, result.start_block, result.end_block, &reason)
                            .await
                    }
                }
            }
        }
    }

    async fn apply_failure(&mut self, failed: FailedJob) -> Result<()> {
        let job = failed.job;
        let reason = format!("fetch failed after {} attempts: {}", failed.attempts, failed.reason);

        self.record_skip(job.contract, job.start_block, job.end_block, &reason).await
    }

    /// One transaction: handler and store per event, then the checkpoint
    async fn commit_result(&self, result: &ScanResult) -> Result<()> {
        let mut tx = self.store.begin().await?;

        let written = async {
            for event in &result.events {
                self.handler.handle(event, &mut tx).await.with_context(|| {
                    format!(
                        "Handler failed on {} at block {} (log {})",
                        event.event, event.block_number, event.log_index
                    )
                })?;
                self.store.store_event(&mut tx, event).await?;
            }
            self.store
                .record_progress(&mut tx, result.contract, result.end_block)
                .await?;
            anyhow::Ok(())
        }
        .await;

        match written {
            Ok(()) => Ok(self.store.commit(tx).await?),
            Err(e) => {
                if let Err(rollback) = self.store.rollback(tx).await {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Audit row for a range the checkpoint will move past. Failing to write it
    /// stops the reducer under either policy, so no range is lost unrecorded.
    async fn record_skip(&mut self, contract: Address, start_block: u64, end_block: u64, reason: &str) -> Result<()> {
        let recorded = async {
            let mut tx = self.store.begin().await?;
            if let Err(e) = self
                .store
                .record_skip(&mut tx, contract, start_block, end_block, reason)
                .await
            {
                if let Err(rollback) = self.store.rollback(tx).await {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                return Err(e);
            }
            self.store.commit(tx).await
        }
        .await;

        recorded.with_context(|| {
            format!(
                "Failed to record skipped range {}-{} for {:?} ({})",
                start_block, end_block, contract, reason
            )
        })?;

        self.report.skipped += 1;
        metrics::counter!("web3scan_ranges_skipped_total").increment(1);
        tracing::warn!(
            "Recorded skipped range {}-{} for {:?}: {}",
            start_block,
            end_block,
            contract,
            reason
        );
        Ok(())
    }
}
