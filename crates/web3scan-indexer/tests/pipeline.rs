use alloy::primitives::{address, Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use web3scan_common::ScanError;
use web3scan_indexer::abi::{InterfaceDefinition, InterfaceRegistry};
use web3scan_indexer::config::{CommitFailurePolicy, ContractDescriptor};
use web3scan_indexer::fetcher::{EndpointPool, LogSource, RetryPolicy};
use web3scan_indexer::handler::EventHandler;
use web3scan_indexer::store::{MemoryStore, MemoryTx};
use web3scan_indexer::types::{DecodedEvent, RawLog};
use web3scan_indexer::{ScanOptions, Scanner};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
    event Swap(address indexed sender, int256 amount0, int256 amount1, uint160 sqrtPriceX96);
}

const TOKEN: Address = address!("00000000000000000000000000000000000000c0");
const POOL: Address = address!("00000000000000000000000000000000000000d0");

const TOKEN_ABI: &str = r#"[
    {"type":"event","name":"Transfer","anonymous":false,"inputs":[
        {"name":"from","type":"address","indexed":true},
        {"name":"to","type":"address","indexed":true},
        {"name":"value","type":"uint256","indexed":false}]}
]"#;

const POOL_ABI: &str = r#"[
    {"type":"event","name":"Swap","anonymous":false,"inputs":[
        {"name":"sender","type":"address","indexed":true},
        {"name":"amount0","type":"int256","indexed":false},
        {"name":"amount1","type":"int256","indexed":false},
        {"name":"sqrtPriceX96","type":"uint160","indexed":false}]}
]"#;

/// Chain of logs keyed by emitting contract. Ranges starting below
/// `slow_below` are answered late so that later jobs finish first.
struct FakeChain {
    name: String,
    head: u64,
    logs: Vec<(Address, RawLog)>,
    slow_below: u64,
    /// Fail this many calls before answering
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FakeChain {
    fn new(name: &str, head: u64, logs: Vec<(Address, RawLog)>) -> Self {
        Self {
            name: name.to_string(),
            head,
            logs,
            slow_below: 0,
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LogSource for FakeChain {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn chain_id(&self) -> Result<u64, ScanError> {
        Ok(31337)
    }

    async fn latest_block(&self) -> Result<u64, ScanError> {
        Ok(self.head)
    }

    async fn fetch_logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
        topics: &[B256],
    ) -> Result<Vec<RawLog>, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ScanError::Rpc(format!("{}: 503 Service Unavailable", self.name)));
        }

        if from_block < self.slow_below {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(self
            .logs
            .iter()
            .filter(|(emitter, log)| {
                *emitter == address
                    && (from_block..=to_block).contains(&log.block_number)
                    && topics.contains(&log.topics[0])
            })
            .map(|(_, log)| log.clone())
            .collect())
    }
}

/// Keeps the order events were handed to the handler in
#[derive(Default)]
struct Journal {
    seen: Mutex<Vec<(Address, u64, u64)>>,
}

#[async_trait]
impl EventHandler<MemoryTx> for Journal {
    async fn handle(&self, event: &DecodedEvent, _tx: &mut MemoryTx) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((event.contract, event.block_number, event.log_index));
        Ok(())
    }
}

fn raw(block_number: u64, log_index: u64, data: alloy::primitives::LogData) -> RawLog {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&block_number.to_be_bytes());
    hash[8..16].copy_from_slice(&log_index.to_be_bytes());

    RawLog {
        block_number,
        transaction_hash: B256::from(hash),
        log_index,
        topics: data.topics().to_vec(),
        data: data.data,
    }
}

fn transfer(block_number: u64, log_index: u64, value: u64) -> (Address, RawLog) {
    let event = Transfer {
        from: address!("1111111111111111111111111111111111111111"),
        to: address!("2222222222222222222222222222222222222222"),
        value: U256::from(value),
    };
    (TOKEN, raw(block_number, log_index, event.encode_log_data()))
}

fn swap(block_number: u64, log_index: u64, amount0: i64) -> (Address, RawLog) {
    let event = Swap {
        sender: address!("3333333333333333333333333333333333333333"),
        amount0: amount0.to_string().parse().unwrap(),
        amount1: (-amount0).to_string().parse().unwrap(),
        sqrtPriceX96: alloy::primitives::U160::from(1u64 << 40),
    };
    (POOL, raw(block_number, log_index, event.encode_log_data()))
}

fn registry(start_block: u64) -> Arc<InterfaceRegistry> {
    let contracts = vec![
        ContractDescriptor {
            name: "token".to_string(),
            address: TOKEN,
            abi_path: PathBuf::from("token.json"),
            events: vec!["Transfer".to_string()],
            start_block,
        },
        ContractDescriptor {
            name: "pool".to_string(),
            address: POOL,
            abi_path: PathBuf::from("pool.json"),
            events: Vec::new(),
            start_block,
        },
    ];

    let registry = InterfaceRegistry::build(&contracts, |path: &Path| {
        if path == Path::new("token.json") {
            InterfaceDefinition::from_json(TOKEN_ABI)
        } else {
            InterfaceDefinition::from_json(POOL_ABI)
        }
    })
    .unwrap();
    Arc::new(registry)
}

fn options(workers: usize, window: u64) -> ScanOptions {
    ScanOptions {
        fetch_workers: workers,
        blocks_per_request: window,
        worker_cooldown: Duration::from_millis(1),
        requests_per_second: 10_000,
        retry: RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
        commit_failure_policy: CommitFailurePolicy::Skip,
        expected_chain_id: Some(31337),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_first_window_does_not_block_later_events() {
    let mut chain = FakeChain::new("node", 180, vec![transfer(160, 0, 5), transfer(172, 3, 6)]);
    chain.slow_below = 150;

    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(Journal::default());
    let scanner = Scanner::new(
        Arc::clone(&store),
        Arc::clone(&journal),
        EndpointPool::new(vec![Arc::new(chain) as Arc<dyn LogSource>]).unwrap(),
        registry(100),
        options(2, 50),
    );

    let report = scanner.run(CancellationToken::new()).await.unwrap();

    let token = report.contracts.iter().find(|c| c.contract == TOKEN).unwrap();
    assert_eq!(token.start_block, 100);
    assert_eq!(token.jobs, 2);
    assert!(report.reducer.stalled.is_empty());

    let state = store.snapshot();
    let token_events: Vec<_> = state
        .events
        .iter()
        .filter(|e| e.contract == TOKEN)
        .map(|e| (e.block_number, e.args["value"].as_uint()))
        .collect();
    assert_eq!(
        token_events,
        vec![(160, Some(U256::from(5))), (172, Some(U256::from(6)))]
    );
    assert_eq!(state.checkpoints[&TOKEN], 180);
    assert_eq!(state.checkpoints[&POOL], 180);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contracts_commit_independently_in_block_order() {
    let mut logs = Vec::new();
    for block in (0..400).step_by(7) {
        logs.push(transfer(block, 0, block));
        if block % 3 == 0 {
            logs.push(swap(block, 1, block as i64 - 200));
        }
    }
    let expected_swaps = logs.iter().filter(|(a, _)| *a == POOL).count();
    let mut chain = FakeChain::new("node", 399, logs);
    chain.slow_below = 100;

    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(Journal::default());
    let scanner = Scanner::new(
        Arc::clone(&store),
        Arc::clone(&journal),
        EndpointPool::new(vec![Arc::new(chain) as Arc<dyn LogSource>]).unwrap(),
        registry(0),
        options(6, 25),
    );

    let report = scanner.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.reducer.committed_results, 32);
    assert_eq!(report.reducer.rolled_back, 0);

    let seen = journal.seen.lock().unwrap().clone();
    for contract in [TOKEN, POOL] {
        let blocks: Vec<_> = seen.iter().filter(|s| s.0 == contract).map(|s| s.1).collect();
        let mut sorted = blocks.clone();
        sorted.sort();
        assert_eq!(blocks, sorted, "{:?} handled out of order", contract);
    }

    let state = store.snapshot();
    let swaps: Vec<_> = state.events.iter().filter(|e| e.contract == POOL).collect();
    assert_eq!(swaps.len(), expected_swaps);
    assert_eq!(swaps[0].args.len(), 4);
    assert_eq!(swaps[0].args_json()["amount0"], "-200");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flaky_endpoints_are_retried_and_dead_ranges_recorded() {
    let flaky = FakeChain::new("flaky", 99, vec![transfer(10, 0, 1), transfer(90, 0, 2)]);
    flaky.failures.store(3, Ordering::SeqCst);

    let store = Arc::new(MemoryStore::new());
    let scanner = Scanner::new(
        Arc::clone(&store),
        Arc::new(Journal::default()),
        EndpointPool::new(vec![Arc::new(flaky) as Arc<dyn LogSource>]).unwrap(),
        registry(0),
        options(1, 50),
    );

    let report = scanner.run(CancellationToken::new()).await.unwrap();

    // 3 failures fit in 4 attempts
    assert_eq!(report.reducer.skipped, 0);
    assert_eq!(store.snapshot().events.len(), 2);

    let dead = FakeChain::new("dead", 99, vec![transfer(10, 0, 1)]);
    dead.failures.store(u32::MAX, Ordering::SeqCst);
    let store = Arc::new(MemoryStore::new());
    let scanner = Scanner::new(
        Arc::clone(&store),
        Arc::new(Journal::default()),
        EndpointPool::new(vec![Arc::new(dead) as Arc<dyn LogSource>]).unwrap(),
        registry(0),
        options(2, 50),
    );

    let report = scanner.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.reducer.skipped, 4);
    assert_eq!(report.reducer.committed_results, 0);

    let state = store.snapshot();
    assert!(state.events.is_empty());
    assert!(state.checkpoints.is_empty());
    assert!(state.skipped.iter().all(|s| s.reason.contains("503")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rerun_resumes_from_checkpoint_without_duplicates() {
    let logs = vec![transfer(5, 0, 1), transfer(55, 0, 2), transfer(120, 0, 3)];
    let store = Arc::new(MemoryStore::new());

    let first = FakeChain::new("node", 60, logs.clone());
    Scanner::new(
        Arc::clone(&store),
        Arc::new(Journal::default()),
        EndpointPool::new(vec![Arc::new(first) as Arc<dyn LogSource>]).unwrap(),
        registry(0),
        options(2, 20),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();
    assert_eq!(store.snapshot().checkpoints[&TOKEN], 60);

    let second = Arc::new(FakeChain::new("node", 130, logs));
    let report = Scanner::new(
        Arc::clone(&store),
        Arc::new(Journal::default()),
        EndpointPool::new(vec![Arc::clone(&second) as Arc<dyn LogSource>]).unwrap(),
        registry(0),
        options(2, 20),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    let token = report.contracts.iter().find(|c| c.contract == TOKEN).unwrap();
    assert_eq!(token.start_block, 61);

    let blocks: Vec<_> = store
        .snapshot()
        .events
        .iter()
        .filter(|e| e.contract == TOKEN)
        .map(|e| e.block_number)
        .collect();
    assert_eq!(blocks, vec![5, 55, 120]);
    assert_eq!(store.snapshot().checkpoints[&TOKEN], 130);
}

#[tokio::test]
async fn test_wrong_chain_is_rejected() {
    let chain = FakeChain::new("node", 10, Vec::new());
    let mut options = options(1, 10);
    options.expected_chain_id = Some(1);

    let store = Arc::new(MemoryStore::new());
    let result = Scanner::new(
        Arc::clone(&store),
        Arc::new(Journal::default()),
        EndpointPool::new(vec![Arc::new(chain) as Arc<dyn LogSource>]).unwrap(),
        registry(0),
        options,
    )
    .run(CancellationToken::new())
    .await;

    assert!(result.is_err());
    assert_eq!(store.snapshot().commits, 0);
}
