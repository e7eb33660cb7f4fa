//! Wallet connection lifecycle.
//!
//! [`WalletConnectionManager`] drives the relay client through pairing,
//! restore and account switching, keeps the persisted session in step and
//! publishes one [`ConnectionSnapshot`](np_api_types::ConnectionSnapshot)
//! per transition.

mod manager;

pub use manager::{RestoreGuard, SNAPSHOT_CAPACITY, WalletConnectionManager};

use np_api_types::Network;
use np_relay::RelayError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("timed out waiting for the wallet to pair")]
    Timeout,
    #[error("connection attempt was cancelled")]
    Cancelled,
    #[error("no wallet connected")]
    NotConnected,
    #[error("connection not found in recent connections: {0}")]
    NotFound(String),
    #[error("stored session has expired")]
    Expired,
    #[error("stored session has incomplete rejoin credentials")]
    MalformedCredentials,
    #[error("relay failure: {0:#}")]
    Relay(anyhow::Error),
}

impl From<RelayError> for WalletError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Timeout => WalletError::Timeout,
            RelayError::Cancelled => WalletError::Cancelled,
            RelayError::NotConnected | RelayError::NotInitialized => WalletError::NotConnected,
            RelayError::Transport(err) => WalletError::Relay(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Budget for the wallet to scan the pairing URI during `connect`.
    pub pairing_timeout: Duration,
    /// Budget for the liveness probe of a resumed session.
    pub rejoin_timeout: Duration,
    /// Pause between re-establishing a resumed channel and probing it.
    pub rejoin_settle: Duration,
    pub initial_network: Network,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(60),
            rejoin_timeout: Duration::from_secs(5),
            rejoin_settle: Duration::from_millis(500),
            initial_network: Network::Testnet,
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pairing_timeout: env_millis("NEXAPAIR_PAIRING_TIMEOUT_MS")
                .unwrap_or(defaults.pairing_timeout),
            rejoin_timeout: env_millis("NEXAPAIR_REJOIN_TIMEOUT_MS")
                .unwrap_or(defaults.rejoin_timeout),
            rejoin_settle: env_millis("NEXAPAIR_REJOIN_SETTLE_MS").unwrap_or(defaults.rejoin_settle),
            initial_network: std::env::var("NEXAPAIR_INITIAL_NETWORK")
                .ok()
                .and_then(|raw| raw.parse::<Network>().ok())
                .unwrap_or(defaults.initial_network),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}
