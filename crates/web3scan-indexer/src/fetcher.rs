use alloy::network::Ethereum;
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use governor::RateLimiter;
use rand::Rng;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use web3scan_common::ScanError;

use crate::types::RawLog;

pub type SharedRateLimiter = Arc<RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>>;

/// Shared limiter for `eth_getLogs` calls across all workers
pub fn rate_limiter(requests_per_second: u32) -> SharedRateLimiter {
    let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(governor::Quota::per_second(rps)))
}

/// Remote source of historical logs, usually one JSON-RPC endpoint
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Endpoint label used in logs
    fn endpoint(&self) -> &str;

    async fn chain_id(&self) -> Result<u64, ScanError>;

    async fn latest_block(&self) -> Result<u64, ScanError>;

    /// Logs emitted by `address` in `[from_block, to_block]` whose topic 0 is
    /// one of `topics`
    async fn fetch_logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
        topics: &[B256],
    ) -> Result<Vec<RawLog>, ScanError>;
}

/// [`LogSource`] backed by an alloy HTTP provider
pub struct AlloyLogSource {
    url: String,
    provider: RootProvider<Ethereum>,
}

impl AlloyLogSource {
    pub fn connect(url: &str) -> Result<Self, ScanError> {
        let parsed: Url = url
            .parse()
            .map_err(|e| ScanError::Config(format!("Invalid RPC URL '{}': {}", url, e)))?;

        Ok(Self {
            url: url.to_string(),
            provider: RootProvider::new_http(parsed),
        })
    }
}

#[async_trait]
impl LogSource for AlloyLogSource {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn chain_id(&self) -> Result<u64, ScanError> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn latest_block(&self) -> Result<u64, ScanError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn fetch_logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
        topics: &[B256],
    ) -> Result<Vec<RawLog>, ScanError> {
        let filter = Filter::new()
            .address(address)
            .from_block(from_block)
            .to_block(to_block)
            .event_signature(topics.to_vec());

        let logs = self.provider.get_logs(&filter).await?;
        logs.into_iter().map(raw_log).collect()
    }
}

/// Historical logs always carry their position; a log without it came from a
/// pending block and can't be ordered.
fn raw_log(log: Log) -> Result<RawLog, ScanError> {
    let block_number = log
        .block_number
        .ok_or_else(|| ScanError::Rpc("log without block number".to_string()))?;
    let transaction_hash = log
        .transaction_hash
        .ok_or_else(|| ScanError::Rpc(format!("log in block {} without transaction hash", block_number)))?;

    let log_index = log
        .log_index
        .ok_or_else(|| ScanError::Rpc(format!("log in block {} without log index", block_number)))?;

    Ok(RawLog {
        block_number,
        transaction_hash,
        log_index,
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
    })
}

/// Configured RPC endpoints. Workers pick one uniformly at random per request;
/// there is no health tracking.
#[derive(Clone)]
pub struct EndpointPool {
    sources: Vec<Arc<dyn LogSource>>,
}

impl EndpointPool {
    pub fn new(sources: Vec<Arc<dyn LogSource>>) -> Result<Self, ScanError> {
        if sources.is_empty() {
            return Err(ScanError::Config("no RPC endpoints configured".to_string()));
        }
        Ok(Self { sources })
    }

    pub fn connect(urls: &[String]) -> Result<Self, ScanError> {
        let sources = urls
            .iter()
            .map(|url| AlloyLogSource::connect(url).map(|s| Arc::new(s) as Arc<dyn LogSource>))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(sources)
    }

    pub fn pick(&self) -> Arc<dyn LogSource> {
        let i = rand::thread_rng().gen_range(0..self.sources.len());
        Arc::clone(&self.sources[i])
    }

    /// First configured endpoint, used for the startup queries
    pub fn primary(&self) -> Arc<dyn LogSource> {
        Arc::clone(&self.sources[0])
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (zero based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run a startup query with retry. Exhausting the retries is fatal for the run.
pub async fn query_with_retry<T, F, Fut>(what: &str, policy: &RetryPolicy, mut query: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScanError>>,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        match query().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("{} succeeded after {} retries", what, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    what,
                    attempt + 1,
                    policy.max_attempts,
                    e,
                    delay
                );
                last_error = Some(e);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "{} failed after {} attempts: {:?}",
        what,
        policy.max_attempts,
        last_error
    ))
}
