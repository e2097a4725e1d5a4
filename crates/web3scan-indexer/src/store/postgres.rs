use alloy::primitives::Address;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use web3scan_common::{ScanCheckpoint, ScanError, SkippedRange, StoredEvent};

use super::EventStore;
use crate::types::DecodedEvent;

/// PostgreSQL backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Stored events of a contract in commit order
    pub async fn events(&self, contract: Address) -> Result<Vec<StoredEvent>, ScanError> {
        let events: Vec<StoredEvent> = sqlx::query_as(
            "SELECT id, contract, event, block_number, tx_hash, log_index, args, indexed_at
             FROM events
             WHERE contract = $1
             ORDER BY id ASC",
        )
        .bind(format!("{:?}", contract))
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    pub async fn skipped_ranges(&self, contract: Address) -> Result<Vec<SkippedRange>, ScanError> {
        let ranges: Vec<SkippedRange> = sqlx::query_as(
            "SELECT id, contract, start_block, end_block, reason, created_at
             FROM skipped_ranges
             WHERE contract = $1
             ORDER BY start_block ASC",
        )
        .bind(format!("{:?}", contract))
        .fetch_all(&self.pool)
        .await?;

        Ok(ranges)
    }
}

#[async_trait]
impl EventStore for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn checkpoint(&self, contract: Address) -> Result<Option<u64>, ScanError> {
        let checkpoint: Option<ScanCheckpoint> = sqlx::query_as(
            "SELECT contract, last_block, updated_at FROM scan_checkpoints WHERE contract = $1",
        )
        .bind(format!("{:?}", contract))
        .fetch_optional(&self.pool)
        .await?;

        Ok(checkpoint.map(|c| c.last_block as u64))
    }

    async fn begin(&self) -> Result<Self::Tx, ScanError> {
        Ok(self.pool.begin().await?)
    }

    async fn store_event(&self, tx: &mut Self::Tx, event: &DecodedEvent) -> Result<(), ScanError> {
        sqlx::query(
            "INSERT INTO events (contract, event, block_number, tx_hash, log_index, args)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (tx_hash, log_index) DO NOTHING",
        )
        .bind(format!("{:?}", event.contract))
        .bind(&event.event)
        .bind(event.block_number as i64)
        .bind(format!("{:?}", event.transaction_hash))
        .bind(event.log_index as i64)
        .bind(event.args_json())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn record_progress(
        &self,
        tx: &mut Self::Tx,
        contract: Address,
        end_block: u64,
    ) -> Result<(), ScanError> {
        sqlx::query(
            "INSERT INTO scan_checkpoints (contract, last_block, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (contract) DO UPDATE SET
                last_block = GREATEST(scan_checkpoints.last_block, $2),
                updated_at = NOW()",
        )
        .bind(format!("{:?}", contract))
        .bind(end_block as i64)
        .execute(&mut **tx)
        .await?;

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
        sqlx::query(
            "INSERT INTO skipped_ranges (contract, start_block, end_block, reason)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(format!("{:?}", contract))
        .bind(start_block as i64)
        .bind(end_block as i64)
        .bind(reason)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), ScanError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), ScanError> {
        Ok(tx.rollback().await?)
    }
}
