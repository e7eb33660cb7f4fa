use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WalletAddress(pub String);

impl WalletAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletAddress {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Material needed to rejoin an existing relay session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    pub session_id: String,
    pub secret: String,
    pub relay_url: String,
    pub version: String,
}

impl SessionCredentials {
    /// Builds credentials only when all four parts are present and non-blank.
    pub fn from_parts(
        session_id: Option<&str>,
        secret: Option<&str>,
        relay_url: Option<&str>,
        version: Option<&str>,
    ) -> Option<Self> {
        let filled = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned)
        };

        Some(Self {
            session_id: filled(session_id)?,
            secret: filled(secret)?,
            relay_url: filled(relay_url)?,
            version: filled(version)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub address: Option<WalletAddress>,
    pub network: Network,
}

/// Everything a UI needs to render the wallet widget, captured at one transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub address: Option<WalletAddress>,
    pub network: Network,
    pub pairing_uri: Option<String>,
    pub error: Option<String>,
    pub balance: u64,
    pub is_connected: bool,
    pub has_stored_session: bool,
}

impl ConnectionSnapshot {
    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            status: self.status,
            address: self.address.clone(),
            network: self.network,
        }
    }
}

/// Identity of this application as shown to the wallet during pairing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DAppInfo {
    pub name: String,
    pub url: String,
    pub description: String,
    pub icon: String,
}

impl Default for DAppInfo {
    fn default() -> Self {
        Self {
            name: "Token Swap Demo".to_owned(),
            url: "https://swap-demo.nexa.org".to_owned(),
            description: "A simple demo showing wallet connectivity and token swaps".to_owned(),
            icon: "https://swap-demo.nexa.org/favicon.ico".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub network: Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchAccountRequest {
    pub address: String,
    pub network: Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignMessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignMessageResponse {
    pub address: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignAndBroadcastRequest {
    pub tx_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignAndBroadcastResponse {
    pub tx_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicknameRequest {
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubkeyRequest {
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubkeyResponse {
    pub address: String,
    pub pubkey: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerJoinRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAliveRequest {
    pub alive: bool,
}
