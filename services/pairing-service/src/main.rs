mod connections;
mod demo;
mod wallet;

use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post, put},
};
use np_chain_client::{ChainQueryBackend, NoopChainBackend};
use np_chain_rostrum::RostrumBackend;
use np_relay::{MemoryRelay, RelayClientConfig, RelaySessionClient};
use np_storage::{KeyValueStore, RocksDbStore, SessionStore};
use np_wallet_core::{ManagerConfig, WalletConnectionManager, WalletError};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    error: String,
}

pub(crate) type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub(crate) type SharedStore = Arc<dyn KeyValueStore>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) manager: Arc<WalletConnectionManager<SharedStore>>,
    pub(crate) relay: MemoryRelay,
}

impl AppState {
    fn new(
        store: SharedStore,
        relay: MemoryRelay,
        chain: Arc<dyn ChainQueryBackend>,
        relay_config: RelayClientConfig,
        manager_config: ManagerConfig,
    ) -> Self {
        let (client, events) = RelaySessionClient::new(
            Arc::new(relay.clone()),
            chain,
            relay_config,
            manager_config.initial_network,
        );
        let manager =
            WalletConnectionManager::new(client, events, SessionStore::new(store), manager_config);
        Self { manager, relay }
    }
}

struct ServiceConfig {
    bind_addr: String,
    data_dir: String,
    chain_backend: String,
}

impl ServiceConfig {
    fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("NEXAPAIR_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            data_dir: std::env::var("NEXAPAIR_DATA_DIR")
                .unwrap_or_else(|_| "./data/nexapair".to_owned()),
            chain_backend: std::env::var("NEXAPAIR_CHAIN_BACKEND")
                .unwrap_or_else(|_| "rostrum".to_owned()),
        }
    }
}

fn chain_backend(kind: &str) -> anyhow::Result<Arc<dyn ChainQueryBackend>> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "rostrum" => Ok(Arc::new(RostrumBackend::new(None))),
        "noop" => Ok(Arc::new(NoopChainBackend::new())),
        other => anyhow::bail!("unsupported NEXAPAIR_CHAIN_BACKEND '{other}'; use rostrum or noop"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServiceConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)?;
    let store: SharedStore = Arc::new(RocksDbStore::open_default(&config.data_dir)?);

    let relay_config = RelayClientConfig::from_env();
    let relay = MemoryRelay::new(relay_config.relay_url.clone());
    let chain = chain_backend(&config.chain_backend)?;
    info!(
        "using {} chain backend, relay {}",
        chain.backend_id(),
        relay_config.relay_url
    );

    let state = AppState::new(store, relay, chain, relay_config, ManagerConfig::from_env());

    let restorer = state.manager.clone();
    tokio::spawn(async move {
        if restorer.attempt_session_restore().await {
            info!("previous wallet session restored");
        }
    });

    let app = build_router(state);

    info!("pairing-service listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/wallet/state", get(wallet::wallet_state))
        .route("/wallet/connect", post(wallet::wallet_connect))
        .route("/wallet/disconnect", post(wallet::wallet_disconnect))
        .route("/wallet/cancel", post(wallet::wallet_cancel))
        .route("/wallet/switch", post(wallet::wallet_switch))
        .route("/wallet/sign-message", post(wallet::wallet_sign_message))
        .route(
            "/wallet/sign-and-broadcast",
            post(wallet::wallet_sign_and_broadcast),
        )
        .route(
            "/connections",
            get(connections::list_connections).delete(connections::clear_connections),
        )
        .route(
            "/connections/{address}",
            axum::routing::delete(connections::remove_connection),
        )
        .route(
            "/connections/{address}/nickname",
            put(connections::rename_connection),
        )
        .route(
            "/pubkeys/{address}",
            get(connections::get_pubkey).put(connections::put_pubkey),
        )
        .route("/demo/peer", get(demo::current_peer))
        .route("/demo/peer/{session_id}/join", post(demo::peer_join))
        .route("/demo/peer/{session_id}/disconnect", post(demo::peer_disconnect))
        .route("/demo/peer/{session_id}/close", post(demo::peer_close))
        .route("/demo/peer/{session_id}/delete", post(demo::peer_delete))
        .route("/demo/peer/{session_id}/alive", post(demo::peer_alive))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "pairing-service",
        status: "ok",
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        service: "pairing-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub(crate) fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn not_found(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn conflict(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub(crate) fn wallet_error(err: WalletError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        WalletError::NotFound(_) => StatusCode::NOT_FOUND,
        WalletError::Cancelled | WalletError::NotConnected => StatusCode::CONFLICT,
        WalletError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        WalletError::Expired | WalletError::MalformedCredentials => StatusCode::BAD_REQUEST,
        WalletError::Relay(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use np_api_types::{ConnectionSnapshot, ConnectionStatus};
    use np_relay::parse_pairing_uri;
    use np_storage::InMemoryStore;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(
            Arc::new(InMemoryStore::new()),
            MemoryRelay::new("wss://relay.test"),
            Arc::new(NoopChainBackend::new()),
            RelayClientConfig {
                relay_url: "wss://relay.test".to_owned(),
                ..RelayClientConfig::default()
            },
            ManagerConfig {
                rejoin_settle: Duration::from_millis(10),
                ..ManagerConfig::default()
            },
        )
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            })
            .expect("valid request");

        let response = app.clone().oneshot(request).await.expect("router is infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn wait_for_status(state: &AppState, status: ConnectionStatus) -> ConnectionSnapshot {
        let mut snapshots = state.manager.subscribe();
        let current = state.manager.snapshot();
        if current.status == status {
            return current;
        }
        loop {
            let snapshot = snapshots.recv().await.expect("snapshot stream open");
            if snapshot.status == status {
                return snapshot;
            }
        }
    }

    /// Runs `/wallet/connect` and joins the returned pairing session as `address`.
    async fn pair(app: &Router, state: &AppState, address: &str) -> anyhow::Result<String> {
        let (status, snapshot) =
            call(app, "POST", "/wallet/connect", Some(json!({ "network": "testnet" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["status"], "connecting");

        let uri = snapshot["pairing_uri"].as_str().expect("pairing uri returned");
        let credentials = parse_pairing_uri(uri).expect("well-formed pairing uri");
        let (status, _) = call(
            app,
            "POST",
            &format!("/demo/peer/{}/join", credentials.session_id),
            Some(json!({ "address": address })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        wait_for_status(state, ConnectionStatus::Connected).await;
        Ok(credentials.session_id)
    }

    #[tokio::test]
    async fn health_and_version() {
        let app = build_router(test_state());

        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, "GET", "/version", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "pairing-service");
    }

    #[tokio::test]
    async fn initial_state_is_disconnected() {
        let app = build_router(test_state());

        let (status, body) = call(&app, "GET", "/wallet/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "disconnected");
        assert_eq!(body["network"], "testnet");
        assert_eq!(body["balance"], 0);
        assert_eq!(body["is_connected"], false);
    }

    #[tokio::test]
    async fn pairing_flow_end_to_end() -> anyhow::Result<()> {
        let state = test_state();
        let app = build_router(state.clone());

        pair(&app, &state, "nexa:qtest123").await?;

        let (_, body) = call(&app, "GET", "/wallet/state", None).await;
        assert_eq!(body["status"], "connected");
        assert_eq!(body["address"], "nexa:qtest123");
        assert_eq!(body["has_stored_session"], true);

        let (status, body) = call(
            &app,
            "POST",
            "/wallet/sign-message",
            Some(json!({ "message": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["address"], "nexa:qtest123");
        assert_eq!(body["signature"].as_str().map(str::len), Some(64));

        let (status, body) = call(&app, "GET", "/connections", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["address"], "nexa:qtest123");

        let (status, body) = call(&app, "POST", "/wallet/disconnect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "disconnected");
        assert_eq!(body["has_stored_session"], false);
        Ok(())
    }

    #[tokio::test]
    async fn recent_connection_management() -> anyhow::Result<()> {
        let state = test_state();
        let app = build_router(state.clone());
        pair(&app, &state, "nexa:qfirst").await?;

        let (status, body) = call(
            &app,
            "PUT",
            "/connections/nexa:qfirst/nickname",
            Some(json!({ "nickname": "Main" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nickname"], "Main");

        let (status, _) = call(
            &app,
            "PUT",
            "/connections/nexa:qother/nickname",
            Some(json!({ "nickname": "Nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "DELETE", "/connections/nexa:qfirst", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, body) = call(&app, "DELETE", "/connections", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
        Ok(())
    }

    #[tokio::test]
    async fn pubkey_cache_round_trip() {
        let app = build_router(test_state());

        let (status, body) = call(&app, "GET", "/pubkeys/nexa:qkey", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pubkey"], Value::Null);

        let (status, _) = call(&app, "PUT", "/pubkeys/nexa:qkey", Some(json!({ "pubkey": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "PUT",
            "/pubkeys/nexa:qkey",
            Some(json!({ "pubkey": "02abcdef" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", "/pubkeys/nexa:qkey", None).await;
        assert_eq!(body["address"], "nexa:qkey");
        assert_eq!(body["pubkey"], "02abcdef");
    }

    #[tokio::test]
    async fn switch_to_unknown_account_is_not_found() {
        let app = build_router(test_state());

        let (status, body) = call(
            &app,
            "POST",
            "/wallet/switch",
            Some(json!({ "address": "nexa:qmissing", "network": "testnet" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().is_some_and(|msg| msg.contains("nexa:qmissing")));
    }

    #[tokio::test]
    async fn signing_without_wallet_conflicts() {
        let app = build_router(test_state());

        let (status, _) = call(
            &app,
            "POST",
            "/wallet/sign-message",
            Some(json!({ "message": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            "POST",
            "/wallet/sign-and-broadcast",
            Some(json!({ "tx_hex": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_returns_to_disconnected() {
        let state = test_state();
        let app = build_router(state.clone());

        let (_, snapshot) =
            call(&app, "POST", "/wallet/connect", Some(json!({ "network": "mainnet" }))).await;
        assert_eq!(snapshot["status"], "connecting");

        let (status, body) = call(&app, "POST", "/wallet/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "disconnected");
        assert_eq!(body["pairing_uri"], Value::Null);
        assert_eq!(body["error"], Value::Null);
    }

    #[tokio::test]
    async fn unreachable_relay_is_bad_gateway() {
        let state = test_state();
        state.relay.set_unreachable(true);
        let app = build_router(state);

        let (status, body) =
            call(&app, "POST", "/wallet/connect", Some(json!({ "network": "testnet" }))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().is_some_and(|msg| !msg.is_empty()));
    }

    #[tokio::test]
    async fn peer_teardown_reaches_wallet_state() -> anyhow::Result<()> {
        let state = test_state();
        let app = build_router(state.clone());
        let session_id = pair(&app, &state, "nexa:qpeer").await?;

        let (status, body) = call(&app, "GET", "/demo/peer", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_id"], session_id.as_str());

        let (status, _) = call(&app, "POST", &format!("/demo/peer/{session_id}/delete"), None).await;
        assert_eq!(status, StatusCode::OK);

        let snapshot = wait_for_status(&state, ConnectionStatus::Disconnected).await;
        assert_eq!(snapshot.address, None);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_demo_peer_is_not_found() {
        let app = build_router(test_state());

        let (status, _) = call(
            &app,
            "POST",
            "/demo/peer/missing/join",
            Some(json!({ "address": "nexa:qx" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn chain_backend_selection() {
        assert!(chain_backend("noop").is_ok());
        assert!(chain_backend("Rostrum").is_ok());
        assert!(chain_backend("electrum").is_err());
    }
}
