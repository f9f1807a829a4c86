//! veilconf: hardened retrieval of a remote configuration blob.
//!
//! The crate discovers bootstrap endpoints from encrypted URL fragments, ranks
//! them by latency, fetches and authenticates a sealed manifest, follows it to
//! the real content endpoints, and caches the verified plaintext. A tamper-aware
//! state machine gates every step and fails closed.
//!
//! Consumers normally only touch [`ConfigVault`].

pub mod audit;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod fragment;
pub mod memory;
pub mod net;
pub mod platform;
pub mod pool;
pub mod resolver;
pub mod seal;
pub mod security;
pub mod storage;
pub mod vault;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use config::VeilConfig;
pub use vault::{ConfigSummary, ConfigVault, ConfigVaultBuilder};
