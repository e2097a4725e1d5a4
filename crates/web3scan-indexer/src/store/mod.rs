use alloy::primitives::Address;
use async_trait::async_trait;
use web3scan_common::ScanError;

use crate::types::DecodedEvent;

#[cfg(any(test, feature = "test-utils"))]
mod memory;
mod postgres;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryState, MemoryStore, MemoryTx, SkippedEntry};
pub use postgres::PgStore;

/// Durable destination for decoded events.
///
/// Only the reducer talks to the store, one transaction at a time. Everything
/// written through a transaction becomes visible on `commit` and is discarded
/// on `rollback`.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    type Tx: Send + 'static;

    /// Highest committed block for the contract, if any
    async fn checkpoint(&self, contract: Address) -> Result<Option<u64>, ScanError>;

    async fn begin(&self) -> Result<Self::Tx, ScanError>;

    async fn store_event(&self, tx: &mut Self::Tx, event: &DecodedEvent) -> Result<(), ScanError>;

    async fn record_progress(
        &self,
        tx: &mut Self::Tx,
        contract: Address,
        end_block: u64,
    ) -> Result<(), ScanError>;

    /// Audit record for a range that was given up
    async fn record_skip(
        &self,
        tx: &mut Self::Tx,
        contract: Address,
        start_block: u64,
        end_block: u64,
        reason: &str,
    ) -> Result<(), ScanError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), ScanError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), ScanError>;
}
