use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// What the reducer does when the handler or the store fails for a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitFailurePolicy {
    /// Roll back, log, and move on to the next result
    #[default]
    Skip,
    /// Roll back and stop the scan, leaving the checkpoint before the failed range
    Halt,
}

impl FromStr for CommitFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(CommitFailurePolicy::Skip),
            "halt" => Ok(CommitFailurePolicy::Halt),
            other => bail!("unknown commit failure policy '{}' (expected skip or halt)", other),
        }
    }
}

/// A contract to scan, as configured in the contracts file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractDescriptor {
    pub name: String,
    pub address: Address,
    pub abi_path: PathBuf,
    /// Event names of interest. Empty means every event in the ABI.
    pub events: Vec<String>,
    pub start_block: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractsFile {
    chain_id: Option<u64>,
    contracts: Vec<ContractEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractEntry {
    name: String,
    abi_path: PathBuf,
    address: String,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    start_block: u64,
}

/// Contracts and chain id loaded from the YAML contracts file
#[derive(Debug, Clone)]
pub struct ContractsConfig {
    pub chain_id: Option<u64>,
    pub contracts: Vec<ContractDescriptor>,
}

impl ContractsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read contracts file {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&yaml, base)
            .with_context(|| format!("Invalid contracts file {}", path.display()))
    }

    /// Relative ABI paths are resolved against `base`, the directory of the
    /// contracts file.
    pub fn parse(yaml: &str, base: &Path) -> Result<Self> {
        let file: ContractsFile = serde_yaml::from_str(yaml)?;

        if file.contracts.is_empty() {
            bail!("no contracts configured");
        }

        let contracts = file
            .contracts
            .into_iter()
            .map(|entry| {
                let address = Address::from_str(entry.address.trim()).with_context(|| {
                    format!("Invalid address '{}' for contract '{}'", entry.address, entry.name)
                })?;
                let abi_path = if entry.abi_path.is_relative() {
                    base.join(&entry.abi_path)
                } else {
                    entry.abi_path
                };
                Ok(ContractDescriptor {
                    name: entry.name,
                    address,
                    abi_path,
                    events: entry.events,
                    start_block: entry.start_block,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { chain_id: file.chain_id, contracts })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub rpc_urls: Vec<String>,
    pub contracts_file: PathBuf,
    pub fetch_workers: u32,
    pub blocks_per_request: u64,
    pub worker_cooldown: Duration,
    pub rpc_requests_per_second: u32,
    pub fetch_max_attempts: u32,
    pub fetch_retry_base: Duration,
    pub fetch_retry_max: Duration,
    pub commit_failure_policy: CommitFailurePolicy,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            database_url: var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: parse_or(&var, "DB_MAX_CONNECTIONS", 5)?,
            rpc_urls: var("RPC_URLS")
                .context("RPC_URLS must be set")?
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect(),
            contracts_file: var("CONTRACTS_FILE")
                .unwrap_or_else(|| "web3scan.yaml".to_string())
                .into(),
            fetch_workers: parse_or(&var, "FETCH_WORKERS", 4)?,
            blocks_per_request: parse_or(&var, "BLOCKS_PER_REQUEST", 1000)?,
            worker_cooldown: Duration::from_millis(parse_or(&var, "WORKER_COOLDOWN_MS", 1000)?),
            rpc_requests_per_second: parse_or(&var, "RPC_REQUESTS_PER_SECOND", 10)?,
            fetch_max_attempts: parse_or(&var, "FETCH_MAX_ATTEMPTS", 5)?,
            fetch_retry_base: Duration::from_millis(parse_or(&var, "FETCH_RETRY_BASE_MS", 500)?),
            fetch_retry_max: Duration::from_millis(parse_or(&var, "FETCH_RETRY_MAX_MS", 30_000)?),
            commit_failure_policy: parse_or(&var, "COMMIT_FAILURE_POLICY", CommitFailurePolicy::Skip)?,
            metrics_port: var("METRICS_PORT")
                .map(|port| port.parse().context("Invalid METRICS_PORT"))
                .transpose()?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rpc_urls.is_empty() {
            bail!("RPC_URLS must contain at least one endpoint");
        }
        if self.fetch_workers == 0 {
            bail!("FETCH_WORKERS must be greater than 0");
        }
        if self.blocks_per_request == 0 {
            bail!("BLOCKS_PER_REQUEST must be greater than 0");
        }
        if self.fetch_max_attempts == 0 {
            bail!("FETCH_MAX_ATTEMPTS must be greater than 0");
        }
        if self.rpc_requests_per_second == 0 {
            bail!("RPC_REQUESTS_PER_SECOND must be greater than 0");
        }
        Ok(())
    }
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        None => Ok(default),
    }
}
