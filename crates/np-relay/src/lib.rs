//! Relay session client.
//!
//! [`RelaySessionClient`] owns the single live connection to the pairing
//! relay. It hands out pairing URIs, waits for the wallet to join, probes
//! resumed sessions and forwards peer/teardown notifications to its owner
//! over one channel. The relay protocol itself sits behind
//! [`RelayTransport`]; [`MemoryRelay`] is an in-process implementation.

mod client;
mod memory;
mod transport;

pub use client::{RelayClientConfig, RelayEvents, RelaySessionClient};
pub use memory::{MemoryPeer, MemoryRelay, parse_pairing_uri};
pub use transport::{RelayConnector, RelayTarget, RelayTimeout, RelayTransport, TransportEvent};

use np_api_types::WalletAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay client is not initialized")]
    NotInitialized,
    #[error("timed out waiting for the wallet")]
    Timeout,
    #[error("wait for wallet was cancelled")]
    Cancelled,
    #[error("no wallet connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl RelayError {
    /// Transport failures that carry a [`RelayTimeout`] are reported as timeouts.
    fn from_transport(err: anyhow::Error) -> Self {
        if err.downcast_ref::<RelayTimeout>().is_some() {
            RelayError::Timeout
        } else {
            RelayError::Transport(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEventKind {
    PeerJoined(WalletAddress),
    PeerDisconnected,
    ChannelClosed,
    SessionDeleted,
}

impl RelayEventKind {
    pub fn is_teardown(&self) -> bool {
        !matches!(self, RelayEventKind::PeerJoined(_))
    }

    fn slot(&self) -> usize {
        match self {
            RelayEventKind::PeerJoined(_) => 0,
            RelayEventKind::PeerDisconnected => 1,
            RelayEventKind::ChannelClosed => 2,
            RelayEventKind::SessionDeleted => 3,
        }
    }
}

impl From<TransportEvent> for RelayEventKind {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::WalletJoined(address) => RelayEventKind::PeerJoined(address),
            TransportEvent::PeerDisconnected => RelayEventKind::PeerDisconnected,
            TransportEvent::Closed => RelayEventKind::ChannelClosed,
            TransportEvent::SessionDeleted => RelayEventKind::SessionDeleted,
        }
    }
}

/// A notification from one `initialize` cycle of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub cycle: u64,
    pub kind: RelayEventKind,
}
