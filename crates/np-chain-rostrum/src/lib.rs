use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use np_chain_client::{ChainEndpoint, ChainQueryBackend, EndpointScheme};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const ROSTRUM: &str = "rostrum";

const CLIENT_NAME: &str = "nexapair";
const PROTOCOL_VERSION: &str = "1.4";

/// Electrum-protocol client for a Rostrum server.
///
/// Speaks newline-delimited JSON-RPC over plain TCP. Connecting performs the
/// `server.version` handshake and keeps the socket open until `disconnect`.
/// Reads `ROSTRUM_CONNECT_TIMEOUT_MS` from the environment at construction
/// time (default: 10000).
pub struct RostrumBackend {
    connect_timeout: Duration,
    connection: Mutex<Option<RostrumConnection>>,
}

struct RostrumConnection {
    network_name: String,
    endpoint: ChainEndpoint,
    server_version: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Default for RostrumBackend {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RostrumBackend {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        let connect_timeout = connect_timeout
            .or_else(|| {
                std::env::var("ROSTRUM_CONNECT_TIMEOUT_MS")
                    .ok()
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .map(Duration::from_millis)
            })
            .unwrap_or_else(|| Duration::from_secs(10));
        Self {
            connect_timeout,
            connection: Mutex::new(None),
        }
    }

    /// Version string the server reported during the handshake.
    pub async fn server_version(&self) -> Option<String> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.server_version.clone())
    }

    pub async fn connected_endpoint(&self) -> Option<(String, ChainEndpoint)> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| (conn.network_name.clone(), conn.endpoint.clone()))
    }
}

// ── Electrum JSON-RPC wire types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[allow(dead_code)]
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

impl RostrumConnection {
    async fn open(network_name: &str, endpoint: &ChainEndpoint) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .with_context(|| format!("rostrum connect {endpoint}"))?;
        let (read_half, write_half) = stream.into_split();

        let mut connection = Self {
            network_name: network_name.to_owned(),
            endpoint: endpoint.clone(),
            server_version: String::new(),
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 1,
        };

        let result = connection
            .call(
                "server.version",
                vec![CLIENT_NAME.into(), PROTOCOL_VERSION.into()],
            )
            .await
            .context("rostrum server.version handshake")?;

        // Result is `[server_software, protocol_version]`.
        connection.server_version = match result {
            serde_json::Value::Array(parts) => parts
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned(),
            other => other.to_string(),
        };

        Ok(connection)
    }

    async fn call(&mut self, method: &str, params: Vec<serde_json::Value>) -> Result<serde_json::Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id,
            method,
            params,
        };
        self.next_id += 1;

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("rostrum {method} write"))?;

        let mut response_line = String::new();
        let read = self
            .reader
            .read_line(&mut response_line)
            .await
            .with_context(|| format!("rostrum {method} read"))?;
        if read == 0 {
            bail!("rostrum closed the connection during {method}");
        }

        let response: RpcResponse = serde_json::from_str(response_line.trim_end())
            .with_context(|| format!("rostrum {method} parse"))?;

        if let Some(err) = response.error {
            bail!("rostrum {method} error {}: {}", err.code, err.message);
        }

        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl ChainQueryBackend for RostrumBackend {
    fn backend_id(&self) -> &str {
        ROSTRUM
    }

    async fn connect(&self, network_name: &str, endpoint: &ChainEndpoint) -> Result<()> {
        if endpoint.scheme != EndpointScheme::Tcp {
            bail!(
                "rostrum backend only speaks tcp, got {}",
                endpoint.scheme.as_str()
            );
        }

        let mut guard = self.connection.lock().await;
        if let Some(existing) = guard.take() {
            debug!(
                "replacing rostrum connection to {} ({})",
                existing.endpoint, existing.network_name
            );
        }

        let connection = tokio::time::timeout(
            self.connect_timeout,
            RostrumConnection::open(network_name, endpoint),
        )
        .await
        .with_context(|| format!("rostrum connect to {endpoint} timed out"))??;

        info!(
            "connected to rostrum {} on {} ({})",
            connection.endpoint, network_name, connection.server_version
        );
        *guard = Some(connection);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(mut connection) = guard.take() {
            if let Err(err) = connection.writer.shutdown().await {
                warn!("rostrum shutdown for {} failed: {}", connection.endpoint, err);
            }
            info!("disconnected from rostrum {}", connection.endpoint);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_server(reply: &'static str) -> Result<ChainEndpoint> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let mut line = String::new();
                if reader.read_line(&mut line).await.is_ok() {
                    let _ = write_half.write_all(reply.as_bytes()).await;
                }
                // Hold the socket until the client hangs up.
                let mut rest = String::new();
                let _ = reader.read_line(&mut rest).await;
            }
        });

        Ok(ChainEndpoint {
            scheme: EndpointScheme::Tcp,
            host: "127.0.0.1".to_owned(),
            port,
        })
    }

    #[tokio::test]
    async fn handshake_records_server_version() -> Result<()> {
        let endpoint =
            fake_server("{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":[\"Rostrum 11.0\",\"1.4\"]}\n").await?;
        let backend = RostrumBackend::new(Some(Duration::from_secs(2)));

        backend.connect("testnet", &endpoint).await?;
        assert!(backend.is_connected().await);
        assert_eq!(backend.server_version().await.as_deref(), Some("Rostrum 11.0"));

        backend.disconnect().await?;
        assert!(!backend.is_connected().await);
        Ok(())
    }

    #[tokio::test]
    async fn rpc_error_fails_connect() -> Result<()> {
        let endpoint = fake_server(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":1,\"message\":\"unsupported protocol\"}}\n",
        )
        .await?;
        let backend = RostrumBackend::new(Some(Duration::from_secs(2)));

        let err = backend
            .connect("testnet", &endpoint)
            .await
            .expect_err("handshake error must fail connect");
        assert!(format!("{err:#}").contains("unsupported protocol"));
        assert!(!backend.is_connected().await);
        Ok(())
    }

    #[tokio::test]
    async fn non_tcp_scheme_is_rejected() {
        let backend = RostrumBackend::default();
        let endpoint = ChainEndpoint {
            scheme: EndpointScheme::Wss,
            host: "electrum.nexa.org".to_owned(),
            port: 20004,
        };
        assert!(backend.connect("mainnet", &endpoint).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_fine() -> Result<()> {
        let backend = RostrumBackend::default();
        backend.disconnect().await?;
        backend.disconnect().await?;
        Ok(())
    }
}
