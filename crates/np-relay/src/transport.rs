use anyhow::Result;
use async_trait::async_trait;
use np_api_types::{DAppInfo, SessionCredentials, WalletAddress};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Raised by transports when their own wait budget runs out.
#[derive(Debug, Error)]
#[error("relay operation timed out")]
pub struct RelayTimeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    WalletJoined(WalletAddress),
    PeerDisconnected,
    Closed,
    SessionDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    Fresh { relay_url: String },
    Resume(SessionCredentials),
}

/// One connection to the pairing relay, as provided by the relay SDK.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn create_session(&self) -> Result<()>;
    fn pairing_uri(&self) -> String;
    fn session_info(&self) -> Option<SessionCredentials>;
    async fn wait_for_wallet(&self, timeout: Duration) -> Result<WalletAddress>;
    fn cancel_wait_for_wallet(&self);
    async fn rejoin_session(&self, timeout: Duration) -> Result<bool>;
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
    async fn sign_message(&self, address: &WalletAddress, message: &str) -> Result<String>;
    async fn sign_transaction(
        &self,
        address: &WalletAddress,
        unsigned_tx_hex: &str,
        broadcast: bool,
    ) -> Result<String>;
    async fn disconnect(&self);
}

pub trait RelayConnector: Send + Sync {
    fn open(&self, target: RelayTarget, dapp: &DAppInfo) -> Result<Arc<dyn RelayTransport>>;
}
