use alloy::primitives::Address;
use tokio_util::sync::CancellationToken;

use crate::types::ScanJob;

/// Split `[start, head]` into consecutive inclusive windows of `window` blocks.
/// The last window is clipped to `head`.
pub fn plan_ranges(start: u64, head: u64, window: u64) -> impl Iterator<Item = (u64, u64)> {
    let window = window.max(1);
    let mut next = Some(start).filter(|s| *s <= head);

    std::iter::from_fn(move || {
        let from = next?;
        let to = from.saturating_add(window - 1).min(head);
        next = to.checked_add(1).filter(|n| *n <= head);
        Some((from, to))
    })
}

/// Sequential producer of one contract's jobs.
///
/// Indices start at 0 and increase by one per job. The generator blocks while
/// the job channel is full and drops its sender when done; once every
/// generator has finished the channel closes and idle workers exit.
pub struct JobGenerator {
    pub contract: Address,
    pub start_block: u64,
    /// Chain head snapshot taken when the scan started
    pub head: u64,
    pub blocks_per_request: u64,
    pub jobs: async_channel::Sender<ScanJob>,
    pub cancel: CancellationToken,
}

impl JobGenerator {
    /// Returns the number of jobs handed to the workers
    pub async fn run(self) -> u64 {
        tracing::debug!(
            "Generating jobs for {:?}: blocks {} to {} in windows of {}",
            self.contract,
            self.start_block,
            self.head,
            self.blocks_per_request
        );

        let mut sent = 0;
        for (index, (start_block, end_block)) in
            plan_ranges(self.start_block, self.head, self.blocks_per_request).enumerate()
        {
            let job = ScanJob {
                contract: self.contract,
                start_block,
                end_block,
                index: index as u64,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Job generation for {:?} cancelled after {} jobs", self.contract, sent);
                    break;
                }
                result = self.jobs.send(job) => {
                    if result.is_err() {
                        tracing::warn!("Job channel closed, stopping generator for {:?}", self.contract);
                        break;
                    }
                    sent += 1;
                }
            }
        }

        tracing::debug!("Generator for {:?} finished with {} jobs", self.contract, sent);
        sent
    }
}
