use anyhow::Result;
use async_trait::async_trait;
use np_api_types::Network;
use std::fmt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointScheme {
    Tcp,
    Ssl,
    Ws,
    Wss,
}

impl EndpointScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointScheme::Tcp => "tcp",
            EndpointScheme::Ssl => "ssl",
            EndpointScheme::Ws => "ws",
            EndpointScheme::Wss => "wss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEndpoint {
    pub scheme: EndpointScheme,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ChainEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

pub const MAINNET_HOST: &str = "electrum.nexa.org";
pub const TESTNET_HOST: &str = "testnet-electrum.nexa.org";

/// Fixed query endpoint for each network.
pub fn endpoint_for(network: Network) -> ChainEndpoint {
    match network {
        Network::Mainnet => ChainEndpoint {
            scheme: EndpointScheme::Tcp,
            host: MAINNET_HOST.to_owned(),
            port: 20001,
        },
        Network::Testnet => ChainEndpoint {
            scheme: EndpointScheme::Tcp,
            host: TESTNET_HOST.to_owned(),
            port: 30001,
        },
    }
}

/// Blockchain query service opened alongside every relay session.
///
/// Only the connect/disconnect lifecycle matters to the pairing code;
/// disconnecting an idle backend must succeed.
#[async_trait]
pub trait ChainQueryBackend: Send + Sync {
    fn backend_id(&self) -> &str;
    async fn connect(&self, network_name: &str, endpoint: &ChainEndpoint) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendActivity {
    pub connects: usize,
    pub disconnects: usize,
    pub network_name: Option<String>,
    pub endpoint: Option<ChainEndpoint>,
}

/// Backend that opens nothing but remembers what it was asked to do.
#[derive(Default)]
pub struct NoopChainBackend {
    activity: Mutex<BackendActivity>,
}

impl NoopChainBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn activity(&self) -> BackendActivity {
        self.activity.lock().await.clone()
    }
}

#[async_trait]
impl ChainQueryBackend for NoopChainBackend {
    fn backend_id(&self) -> &str {
        "noop"
    }

    async fn connect(&self, network_name: &str, endpoint: &ChainEndpoint) -> Result<()> {
        let mut guard = self.activity.lock().await;
        guard.connects += 1;
        guard.network_name = Some(network_name.to_owned());
        guard.endpoint = Some(endpoint.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.activity.lock().await;
        guard.disconnects += 1;
        guard.network_name = None;
        guard.endpoint = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.activity.lock().await.network_name.is_some()
    }
}
