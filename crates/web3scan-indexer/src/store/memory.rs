use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use web3scan_common::ScanError;

use super::EventStore;
use crate::types::DecodedEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub contract: Address,
    pub start_block: u64,
    pub end_block: u64,
    pub reason: String,
}

/// Committed contents of a [`MemoryStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    /// In commit order
    pub events: Vec<DecodedEvent>,
    pub checkpoints: HashMap<Address, u64>,
    pub skipped: Vec<SkippedEntry>,
    pub commits: usize,
    pub rollbacks: usize,
}

/// Writes staged by an open transaction
#[derive(Debug, Default)]
pub struct MemoryTx {
    events: Vec<DecodedEvent>,
    checkpoints: Vec<(Address, u64)>,
    skipped: Vec<SkippedEntry>,
}

/// In-process store with the same transactional behaviour as [`super::PgStore`]:
/// staged writes only become visible on commit, and events are unique by
/// `(transaction_hash, log_index)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_block: Option<u64>,
    reject_skips: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing checkpoint, as if a previous run committed up to `block`
    pub fn with_checkpoint(self, contract: Address, block: u64) -> Self {
        self.lock().checkpoints.insert(contract, block);
        self
    }

    /// Make `store_event` fail for every event in `block`
    pub fn failing_at_block(mut self, block: u64) -> Self {
        self.fail_block = Some(block);
        self
    }

    /// Make every `record_skip` fail
    pub fn rejecting_skips(mut self) -> Self {
        self.reject_skips = true;
        self
    }

    pub fn snapshot(&self) -> MemoryState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    type Tx = MemoryTx;

    async fn checkpoint(&self, contract: Address) -> Result<Option<u64>, ScanError> {
        Ok(self.lock().checkpoints.get(&contract).copied())
    }

    async fn begin(&self) -> Result<Self::Tx, ScanError> {
        Ok(MemoryTx::default())
    }

    async fn store_event(&self, tx: &mut Self::Tx, event: &DecodedEvent) -> Result<(), ScanError> {
        if self.fail_block == Some(event.block_number) {
            return Err(ScanError::Internal(format!(
                "store rejected event in block {}",
                event.block_number
            )));
        }
        tx.events.push(event.clone());
        Ok(())
    }

    async fn record_progress(
        &self,
        tx: &mut Self::Tx,
        contract: Address,
        end_block: u64,
    ) -> Result<(), ScanError> {
        tx.checkpoints.push((contract, end_block));
        Ok(())
    }

    async fn record_skip(
        &self,
        tx: &mut Self::Tx,
        contract: Address,
        start_block: u64,
        end_block: u64,
        reason: &str,
    ) -> Result<(), ScanError> {
        if self.reject_skips {
            return Err(ScanError::Internal(format!(
                "store rejected skipped range {}-{}",
                start_block, end_block
            )));
        }
        tx.skipped.push(SkippedEntry {
            contract,
            start_block,
            end_block,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), ScanError> {
        let mut state = self.lock();

        let mut seen: HashSet<(B256, u64)> = state
            .events
            .iter()
            .map(|e| (e.transaction_hash, e.log_index))
            .collect();
        for event in tx.events {
            if seen.insert((event.transaction_hash, event.log_index)) {
                state.events.push(event);
            }
        }

        for (contract, block) in tx.checkpoints {
            let checkpoint = state.checkpoints.entry(contract).or_insert(block);
            *checkpoint = (*checkpoint).max(block);
        }
        state.skipped.extend(tx.skipped);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Tx) -> Result<(), ScanError> {
        self.lock().rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use std::collections::BTreeMap;

    const CONTRACT: Address = address!("00000000000000000000000000000000000000c0");

    fn event(block_number: u64, log_index: u64) -> DecodedEvent {
        DecodedEvent {
            contract: CONTRACT,
            event: "Transfer".to_string(),
            block_number,
            transaction_hash: B256::repeat_byte(block_number as u8),
            log_index,
            args: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        store.store_event(&mut tx, &event(10, 0)).await.unwrap();
        store.record_progress(&mut tx, CONTRACT, 19).await.unwrap();
        assert!(store.snapshot().events.is_empty());

        store.commit(tx).await.unwrap();
        let state = store.snapshot();
        assert_eq!(state.events.len(), 1);
        assert_eq!(store.checkpoint(CONTRACT).await.unwrap(), Some(19));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        store.store_event(&mut tx, &event(10, 0)).await.unwrap();
        store.record_skip(&mut tx, CONTRACT, 0, 9, "boom").await.unwrap();
        store.rollback(tx).await.unwrap();

        let state = store.snapshot();
        assert!(state.events.is_empty());
        assert!(state.skipped.is_empty());
        assert_eq!(state.rollbacks, 1);
        assert_eq!(store.checkpoint(CONTRACT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_events_are_ignored_and_checkpoint_never_regresses() {
        let store = MemoryStore::new().with_checkpoint(CONTRACT, 50);

        for _ in 0..2 {
            let mut tx = store.begin().await.unwrap();
            store.store_event(&mut tx, &event(10, 1)).await.unwrap();
            store.record_progress(&mut tx, CONTRACT, 20).await.unwrap();
            store.commit(tx).await.unwrap();
        }

        let state = store.snapshot();
        assert_eq!(state.events.len(), 1);
        assert_eq!(state.commits, 2);
        assert_eq!(state.checkpoints[&CONTRACT], 50);
    }

    #[tokio::test]
    async fn test_failing_block() {
        let store = MemoryStore::new().failing_at_block(7);
        let mut tx = store.begin().await.unwrap();
        assert!(store.store_event(&mut tx, &event(7, 0)).await.is_err());
        assert!(store.store_event(&mut tx, &event(8, 0)).await.is_ok());
    }
}
