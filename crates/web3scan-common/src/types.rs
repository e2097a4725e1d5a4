use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Decoded event as stored in the database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub contract: String,
    pub event: String,
    pub block_number: i64,
    pub tx_hash: String,
    pub log_index: i64,
    pub args: serde_json::Value,
    pub indexed_at: DateTime<Utc>,
}

/// Highest block whose events have been committed for a contract
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScanCheckpoint {
    pub contract: String,
    pub last_block: i64,
    pub updated_at: DateTime<Utc>,
}

/// Block range that was permanently given up, kept for audit
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SkippedRange {
    pub id: i64,
    pub contract: String,
    pub start_block: i64,
    pub end_block: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
