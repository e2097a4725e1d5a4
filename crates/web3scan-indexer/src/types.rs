use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, Bytes, B256, I256, U256};
use std::collections::BTreeMap;

/// A raw log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    /// Slot 0 is the event signature hash
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Work item for a worker - one block range of one contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanJob {
    pub contract: Address,
    pub start_block: u64,
    /// Inclusive
    pub end_block: u64,
    /// Position in the contract's job sequence, the only ordering key downstream
    pub index: u64,
}

/// Events decoded from a completed job, possibly none
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub contract: Address,
    pub index: u64,
    pub start_block: u64,
    pub end_block: u64,
    pub events: Vec<DecodedEvent>,
}

/// A job that was given up permanently
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: ScanJob,
    pub reason: String,
    pub attempts: u32,
}

/// Message sent from workers to the reducer, exactly one per job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(ScanResult),
    Failed(FailedJob),
}

impl JobOutcome {
    pub fn contract(&self) -> Address {
        match self {
            JobOutcome::Completed(result) => result.contract,
            JobOutcome::Failed(failed) => failed.job.contract,
        }
    }

    pub fn index(&self) -> u64 {
        match self {
            JobOutcome::Completed(result) => result.index,
            JobOutcome::Failed(failed) => failed.job.index,
        }
    }
}

/// One occurrence of a tracked event with its arguments resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub contract: Address,
    pub event: String,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub args: BTreeMap<String, ArgValue>,
}

impl DecodedEvent {
    /// Arguments as a JSON object, ready for the `args` column
    pub fn args_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.args
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

/// Decoded argument value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Address(Address),
    Uint(U256),
    Int(I256),
    Bool(bool),
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<ArgValue>),
    Tuple(Vec<ArgValue>),
}

impl ArgValue {
    /// Integers are rendered as decimal strings so that values above 2^53
    /// survive a round trip through JSON consumers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            ArgValue::Address(address) => Value::String(format!("{:?}", address)),
            ArgValue::Uint(value) => Value::String(value.to_string()),
            ArgValue::Int(value) => Value::String(value.to_string()),
            ArgValue::Bool(value) => Value::Bool(*value),
            ArgValue::FixedBytes(bytes) | ArgValue::Bytes(bytes) => {
                Value::String(format!("0x{}", hex::encode(bytes)))
            }
            ArgValue::String(value) => Value::String(value.clone()),
            ArgValue::Array(values) | ArgValue::Tuple(values) => {
                Value::Array(values.iter().map(ArgValue::to_json).collect())
            }
        }
    }

    pub fn as_address(&self) -> Option<Address> {
        match self {
            ArgValue::Address(address) => Some(*address),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<U256> {
        match self {
            ArgValue::Uint(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<DynSolValue> for ArgValue {
    fn from(value: DynSolValue) -> Self {
        match value {
            DynSolValue::Bool(b) => ArgValue::Bool(b),
            DynSolValue::Int(i, _) => ArgValue::Int(i),
            DynSolValue::Uint(u, _) => ArgValue::Uint(u),
            DynSolValue::FixedBytes(word, size) => {
                ArgValue::FixedBytes(word.as_slice()[..size].to_vec())
            }
            DynSolValue::Address(address) => ArgValue::Address(address),
            DynSolValue::Function(function) => ArgValue::FixedBytes(function.as_slice().to_vec()),
            DynSolValue::Bytes(bytes) => ArgValue::Bytes(bytes),
            DynSolValue::String(s) => ArgValue::String(s),
            DynSolValue::Array(values) | DynSolValue::FixedArray(values) => {
                ArgValue::Array(values.into_iter().map(ArgValue::from).collect())
            }
            DynSolValue::Tuple(values) => {
                ArgValue::Tuple(values.into_iter().map(ArgValue::from).collect())
            }
            // Struct values only exist with the eip712 feature
            #[allow(unreachable_patterns)]
            other => ArgValue::Bytes(other.abi_encode()),
        }
    }
}
