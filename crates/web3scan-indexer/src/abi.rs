use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::{Address, B256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use web3scan_common::ScanError;

use crate::config::ContractDescriptor;

/// Events of one contract interface, keyed by signature hash (topic 0)
#[derive(Debug, Clone, Default)]
pub struct InterfaceDefinition {
    events: HashMap<B256, Event>,
}

impl InterfaceDefinition {
    pub fn from_abi(abi: &JsonAbi) -> Self {
        Self::from_events(abi.events().cloned())
    }

    pub fn from_events(events: impl IntoIterator<Item = Event>) -> Self {
        // Anonymous events have no signature topic and can't be matched
        let events = events
            .into_iter()
            .filter(|event| !event.anonymous)
            .map(|event| (event.selector(), event))
            .collect();

        Self { events }
    }

    pub fn from_json(json: &str) -> Result<Self, ScanError> {
        let abi: JsonAbi = serde_json::from_str(json)
            .map_err(|e| ScanError::Interface(format!("Failed to parse ABI: {}", e)))?;
        Ok(Self::from_abi(&abi))
    }

    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ScanError::Interface(format!("Failed to read ABI file '{}': {}", path.display(), e))
        })?;
        Self::from_json(&json).map_err(|e| {
            ScanError::Interface(format!("Invalid ABI file '{}': {}", path.display(), e))
        })
    }

    pub fn event_by_topic(&self, topic: &B256) -> Option<&Event> {
        self.events.get(topic)
    }

    /// Topic 0 filter for the given event names. An empty list selects every
    /// event of the interface. Overloaded names select every overload.
    pub fn topics_for(&self, names: &[String]) -> Result<Vec<B256>, ScanError> {
        let mut topics: Vec<B256> = if names.is_empty() {
            self.events.keys().copied().collect()
        } else {
            let mut topics = Vec::new();
            for name in names {
                let before = topics.len();
                topics.extend(
                    self.events
                        .iter()
                        .filter(|(_, event)| &event.name == name)
                        .map(|(topic, _)| *topic),
                );
                if topics.len() == before {
                    return Err(ScanError::Config(format!(
                        "Event '{}' not found in interface",
                        name
                    )));
                }
            }
            topics
        };

        topics.sort();
        topics.dedup();
        Ok(topics)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A configured contract together with its resolved interface
#[derive(Debug, Clone)]
pub struct TrackedContract {
    pub descriptor: ContractDescriptor,
    pub interface: Arc<InterfaceDefinition>,
    /// Signature hashes passed to `eth_getLogs` as the topic 0 filter
    pub topics: Vec<B256>,
}

/// Immutable lookup from contract address to its interface.
///
/// Built once at startup and shared read-only with all workers. Contracts
/// that point at the same ABI file share a single [`InterfaceDefinition`].
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    contracts: Vec<TrackedContract>,
    by_address: HashMap<Address, usize>,
}

impl InterfaceRegistry {
    /// Load every contract's ABI from disk
    pub fn load(contracts: &[ContractDescriptor]) -> Result<Self, ScanError> {
        Self::build(contracts, InterfaceDefinition::load)
    }

    pub fn build<F>(contracts: &[ContractDescriptor], mut loader: F) -> Result<Self, ScanError>
    where
        F: FnMut(&Path) -> Result<InterfaceDefinition, ScanError>,
    {
        let mut files: HashMap<PathBuf, Arc<InterfaceDefinition>> = HashMap::new();
        let mut registry = Self::default();

        for descriptor in contracts {
            if registry.by_address.contains_key(&descriptor.address) {
                return Err(ScanError::Config(format!(
                    "Contract {:?} is configured more than once",
                    descriptor.address
                )));
            }

            let interface = match files.get(&descriptor.abi_path) {
                Some(interface) => Arc::clone(interface),
                None => {
                    let interface = Arc::new(loader(&descriptor.abi_path)?);
                    files.insert(descriptor.abi_path.clone(), Arc::clone(&interface));
                    interface
                }
            };

            let topics = interface.topics_for(&descriptor.events).map_err(|e| {
                ScanError::Config(format!("Contract '{}': {}", descriptor.name, e))
            })?;
            // An empty topic 0 filter would match every log of the contract
            if topics.is_empty() {
                return Err(ScanError::Config(format!(
                    "Contract '{}': interface has no non-anonymous events to track",
                    descriptor.name
                )));
            }

            tracing::debug!(
                "Tracking {} event signature(s) for contract '{}' ({:?})",
                topics.len(),
                descriptor.name,
                descriptor.address
            );

            registry.by_address.insert(descriptor.address, registry.contracts.len());
            registry.contracts.push(TrackedContract {
                descriptor: descriptor.clone(),
                interface,
                topics,
            });
        }

        Ok(registry)
    }

    pub fn get(&self, address: &Address) -> Option<&TrackedContract> {
        self.by_address.get(address).map(|&i| &self.contracts[i])
    }

    pub fn contracts(&self) -> impl Iterator<Item = &TrackedContract> {
        self.contracts.iter()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}
