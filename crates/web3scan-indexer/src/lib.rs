//! Historical event log scanner.
//!
//! Per-contract job generators split block ranges into windows, a pool of
//! workers fetches and decodes the logs of each window, and a single reducer
//! commits the results in order.

pub mod abi;
pub mod config;
pub mod decoder;
pub mod fetcher;
pub mod handler;
pub mod jobs;
pub mod reducer;
pub mod scanner;
pub mod store;
pub mod types;
pub mod worker;

pub use scanner::{ScanOptions, ScanReport, Scanner};
