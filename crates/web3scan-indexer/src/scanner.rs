use alloy::primitives::Address;
use anyhow::{bail, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::abi::InterfaceRegistry;
use crate::config::{CommitFailurePolicy, Config};
use crate::fetcher::{query_with_retry, rate_limiter, EndpointPool, RetryPolicy};
use crate::handler::EventHandler;
use crate::jobs::JobGenerator;
use crate::reducer::{Reducer, ReducerReport};
use crate::store::EventStore;
use crate::types::JobOutcome;
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub fetch_workers: usize,
    pub blocks_per_request: u64,
    pub worker_cooldown: Duration,
    pub requests_per_second: u32,
    pub retry: RetryPolicy,
    pub commit_failure_policy: CommitFailurePolicy,
    /// Refuse to scan when the endpoints report a different chain
    pub expected_chain_id: Option<u64>,
}

impl ScanOptions {
    pub fn from_config(config: &Config, expected_chain_id: Option<u64>) -> Self {
        Self {
            fetch_workers: config.fetch_workers as usize,
            blocks_per_request: config.blocks_per_request,
            worker_cooldown: config.worker_cooldown,
            requests_per_second: config.rpc_requests_per_second,
            retry: RetryPolicy {
                max_attempts: config.fetch_max_attempts,
                base_delay: config.fetch_retry_base,
                max_delay: config.fetch_retry_max,
            },
            commit_failure_policy: config.commit_failure_policy,
            expected_chain_id,
        }
    }
}

/// Where a contract's scan started in this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractPlan {
    pub contract: Address,
    pub name: String,
    pub start_block: u64,
    pub jobs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Chain head the run scanned up to
    pub head: u64,
    pub contracts: Vec<ContractPlan>,
    pub reducer: ReducerReport,
    pub cancelled: bool,
}

/// Wires generators, workers and the reducer together for one pass over
/// `[start, head]` of every tracked contract.
pub struct Scanner<S: EventStore, H: EventHandler<S::Tx>> {
    store: Arc<S>,
    handler: Arc<H>,
    endpoints: EndpointPool,
    registry: Arc<InterfaceRegistry>,
    options: ScanOptions,
}

impl<S: EventStore, H: EventHandler<S::Tx>> Scanner<S, H> {
    pub fn new(
        store: Arc<S>,
        handler: Arc<H>,
        endpoints: EndpointPool,
        registry: Arc<InterfaceRegistry>,
        options: ScanOptions,
    ) -> Self {
        Self {
            store,
            handler,
            endpoints,
            registry,
            options,
        }
    }

    /// Scan every contract from its resume point up to the chain head observed
    /// at startup.
    ///
    /// Cancelling `cancel` stops job generation and lets in-flight results
    /// drain through the reducer. An error from the reducer (a rolled back
    /// result under [`CommitFailurePolicy::Halt`], or a skipped range that
    /// could not be recorded) stops the whole pipeline.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ScanReport> {
        let retry = self.options.retry;
        let primary = self.endpoints.primary();

        if let Some(expected) = self.options.expected_chain_id {
            let chain_id = query_with_retry("eth_chainId", &retry, || primary.chain_id()).await?;
            if chain_id != expected {
                bail!(
                    "Endpoint {} is on chain {}, expected chain {}",
                    primary.endpoint(),
                    chain_id,
                    expected
                );
            }
            tracing::info!("Connected to chain {}", chain_id);
        }

        let head = query_with_retry("eth_blockNumber", &retry, || primary.latest_block()).await?;
        tracing::info!("Chain head: {}", head);

        let mut plans = Vec::with_capacity(self.registry.len());
        for tracked in self.registry.contracts() {
            let descriptor = &tracked.descriptor;
            let checkpoint = self.store.checkpoint(descriptor.address).await?;
            let start_block = match checkpoint {
                Some(last) => descriptor.start_block.max(last.saturating_add(1)),
                None => descriptor.start_block,
            };

            if start_block > head {
                tracing::info!("Contract '{}' is up to date (checkpoint {:?})", descriptor.name, checkpoint);
            } else {
                tracing::info!(
                    "Scanning contract '{}' ({:?}) from block {} to {}",
                    descriptor.name,
                    descriptor.address,
                    start_block,
                    head
                );
            }

            plans.push(ContractPlan {
                contract: descriptor.address,
                name: descriptor.name.clone(),
                start_block,
                jobs: 0,
            });
        }

        let num_workers = self.options.fetch_workers.max(1);
        tracing::info!(
            "Starting {} fetch workers with {} blocks per request, {} req/sec",
            num_workers,
            self.options.blocks_per_request,
            self.options.requests_per_second
        );

        // Halting the reducer must not cancel the caller's token
        let pipeline = cancel.child_token();

        let (job_tx, job_rx) = async_channel::bounded(num_workers * 2);
        let (result_tx, result_rx) = mpsc::channel::<JobOutcome>(num_workers * 2);
        let limiter = rate_limiter(self.options.requests_per_second);

        let reducer = tokio::spawn(
            Reducer::new(
                Arc::clone(&self.store),
                Arc::clone(&self.handler),
                result_rx,
                self.options.commit_failure_policy,
            )
            .run(),
        );

        let workers: Vec<_> = (0..num_workers)
            .map(|id| {
                tokio::spawn(
                    Worker {
                        id,
                        jobs: job_rx.clone(),
                        results: result_tx.clone(),
                        endpoints: self.endpoints.clone(),
                        registry: Arc::clone(&self.registry),
                        limiter: Arc::clone(&limiter),
                        retry,
                        cooldown: self.options.worker_cooldown,
                        cancel: pipeline.clone(),
                    }
                    .run(),
                )
            })
            .collect();

        // Channels close once every worker and generator has dropped its end
        drop(job_rx);
        drop(result_tx);

        let generators: Vec<_> = plans
            .iter()
            .map(|plan| {
                tokio::spawn(
                    JobGenerator {
                        contract: plan.contract,
                        start_block: plan.start_block,
                        head,
                        blocks_per_request: self.options.blocks_per_request,
                        jobs: job_tx.clone(),
                        cancel: pipeline.clone(),
                    }
                    .run(),
                )
            })
            .collect();
        drop(job_tx);

        let reduced = reducer.await?;
        if reduced.is_err() {
            pipeline.cancel();
        }

        for worker in join_all(workers).await {
            worker?;
        }
        for (plan, sent) in plans.iter_mut().zip(join_all(generators).await) {
            plan.jobs = sent?;
        }

        let report = ScanReport {
            head,
            contracts: plans,
            reducer: reduced?,
            cancelled: cancel.is_cancelled(),
        };

        tracing::info!(
            "Scan finished at head {}: {} results ({} events) committed, {} rolled back, {} ranges skipped",
            report.head,
            report.reducer.committed_results,
            report.reducer.committed_events,
            report.reducer.rolled_back,
            report.reducer.skipped
        );

        Ok(report)
    }
}
