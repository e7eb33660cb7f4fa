use np_api_types::{DAppInfo, Network, SessionCredentials, WalletAddress};
use np_chain_client::{ChainQueryBackend, endpoint_for};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    RelayConnector, RelayError, RelayEvent, RelayEventKind, RelayTarget, RelayTransport,
    TransportEvent,
};

pub const DEFAULT_RELAY_URL: &str = "wss://relay.otoplo.com";

/// Receiving end of the client's event channel. There is exactly one per client.
pub type RelayEvents = mpsc::UnboundedReceiver<RelayEvent>;

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub relay_url: String,
    pub dapp: DAppInfo,
    pub connect_timeout: Duration,
    pub sign_timeout: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            dapp: DAppInfo::default(),
            connect_timeout: Duration::from_secs(15),
            sign_timeout: Duration::from_secs(120),
        }
    }
}

impl RelayClientConfig {
    /// Reads `NEXAPAIR_RELAY_URL`, `NEXAPAIR_RELAY_CONNECT_TIMEOUT_MS` and
    /// `NEXAPAIR_SIGN_TIMEOUT_MS`, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            relay_url: std::env::var("NEXAPAIR_RELAY_URL")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.relay_url),
            dapp: defaults.dapp,
            connect_timeout: env_millis("NEXAPAIR_RELAY_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            sign_timeout: env_millis("NEXAPAIR_SIGN_TIMEOUT_MS").unwrap_or(defaults.sign_timeout),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

struct Binding {
    cycle: u64,
    transport: Arc<dyn RelayTransport>,
    wait_cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

struct ClientState {
    network: Network,
    binding: Option<Binding>,
    connected_address: Option<WalletAddress>,
}

fn lock(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owner of the one live relay transport (and its blockchain-query
/// connection). Each `initialize` starts a new cycle; everything from the
/// previous cycle is torn down first.
pub struct RelaySessionClient {
    connector: Arc<dyn RelayConnector>,
    chain: Arc<dyn ChainQueryBackend>,
    config: RelayClientConfig,
    events: mpsc::UnboundedSender<RelayEvent>,
    cycles: AtomicU64,
    state: Arc<Mutex<ClientState>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl RelaySessionClient {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        chain: Arc<dyn ChainQueryBackend>,
        config: RelayClientConfig,
        network: Network,
    ) -> (Self, RelayEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let client = Self {
            connector,
            chain,
            config,
            events,
            cycles: AtomicU64::new(0),
            state: Arc::new(Mutex::new(ClientState {
                network,
                binding: None,
                connected_address: None,
            })),
            lifecycle: tokio::sync::Mutex::new(()),
        };
        (client, receiver)
    }

    pub fn config(&self) -> &RelayClientConfig {
        &self.config
    }

    /// Opens a new relay connection and returns its pairing URI.
    ///
    /// Without credentials a brand-new session is created. With credentials
    /// the channel for that existing session is re-established; whether the
    /// wallet is still there is for [`Self::rejoin_session`] to find out.
    pub async fn initialize(
        &self,
        network: Network,
        credentials: Option<&SessionCredentials>,
    ) -> Result<String, RelayError> {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = {
            let mut state = lock(&self.state);
            state.network = network;
            state.connected_address = None;
            state.binding.take()
        };
        if let Some(binding) = previous {
            self.teardown(binding).await;
        }

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;

        let endpoint = endpoint_for(network);
        match tokio::time::timeout(
            self.config.connect_timeout,
            self.chain.connect(network.as_str(), &endpoint),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(RelayError::Transport(err)),
            Err(_) => {
                self.disconnect_chain().await;
                return Err(RelayError::Timeout);
            }
        }

        let target = match credentials {
            Some(creds) => RelayTarget::Resume(creds.clone()),
            None => RelayTarget::Fresh {
                relay_url: self.config.relay_url.clone(),
            },
        };
        let fresh = matches!(target, RelayTarget::Fresh { .. });

        let transport = match self.connector.open(target, &self.config.dapp) {
            Ok(transport) => transport,
            Err(err) => {
                self.disconnect_chain().await;
                return Err(RelayError::Transport(err));
            }
        };

        let handshake = async {
            transport.connect().await?;
            if fresh {
                transport.create_session().await?;
            }
            anyhow::Ok(())
        };
        let outcome = match tokio::time::timeout(self.config.connect_timeout, handshake).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(RelayError::from_transport(err)),
            Err(_) => Err(RelayError::Timeout),
        };
        if let Err(err) = outcome {
            warn!("relay handshake for cycle {} failed: {}", cycle, err);
            transport.disconnect().await;
            self.disconnect_chain().await;
            return Err(err);
        }

        let pairing_uri = transport.pairing_uri();
        let incoming = transport.subscribe();

        {
            let mut state = lock(&self.state);
            // Spawned under the lock so the forwarder only ever sees this binding installed.
            let forwarder = tokio::spawn(forward_events(
                cycle,
                incoming,
                self.events.clone(),
                self.state.clone(),
            ));
            state.binding = Some(Binding {
                cycle,
                transport,
                wait_cancel: CancellationToken::new(),
                forwarder,
            });
        }

        info!(
            "relay cycle {} initialized on {} ({})",
            cycle,
            network,
            if fresh { "new session" } else { "resumed session" }
        );
        Ok(pairing_uri)
    }

    /// Waits for the wallet to complete pairing.
    ///
    /// A wait cancelled through [`Self::cancel_wait_for_wallet`] never binds
    /// an address, even when the join arrives in the same instant.
    pub async fn wait_for_wallet(&self, timeout: Duration) -> Result<WalletAddress, RelayError> {
        let (cycle, transport, token) = {
            let mut state = lock(&self.state);
            let binding = state.binding.as_mut().ok_or(RelayError::NotInitialized)?;
            binding.wait_cancel = CancellationToken::new();
            (
                binding.cycle,
                binding.transport.clone(),
                binding.wait_cancel.clone(),
            )
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(RelayError::Cancelled),
            result = tokio::time::timeout(timeout, transport.wait_for_wallet(timeout)) => match result {
                Ok(Ok(address)) => Ok(address),
                Ok(Err(err)) => Err(RelayError::from_transport(err)),
                Err(_) => Err(RelayError::Timeout),
            },
        };

        match outcome {
            Ok(address) => {
                let mut state = lock(&self.state);
                let current = state.binding.as_ref().map(|binding| binding.cycle) == Some(cycle);
                if token.is_cancelled() || !current {
                    debug!(
                        "discarding wallet {} from cancelled wait in cycle {}",
                        address, cycle
                    );
                    return Err(RelayError::Cancelled);
                }
                state.connected_address = Some(address.clone());
                Ok(address)
            }
            Err(_) if token.is_cancelled() => Err(RelayError::Cancelled),
            Err(err) => {
                // Release the transport's listener for the expired wait.
                transport.cancel_wait_for_wallet();
                Err(err)
            }
        }
    }

    pub fn cancel_wait_for_wallet(&self) {
        let transport = {
            let state = lock(&self.state);
            match state.binding.as_ref() {
                Some(binding) => {
                    binding.wait_cancel.cancel();
                    binding.transport.clone()
                }
                None => return,
            }
        };
        transport.cancel_wait_for_wallet();
    }

    /// Asks whether the resumed session still has its wallet. Every failure,
    /// including a timeout, reads as `false`.
    pub async fn rejoin_session(&self, timeout: Duration) -> bool {
        let transport = {
            let state = lock(&self.state);
            match state.binding.as_ref() {
                Some(binding) => binding.transport.clone(),
                None => return false,
            }
        };

        match tokio::time::timeout(timeout, transport.rejoin_session(timeout)).await {
            Ok(Ok(alive)) => alive,
            Ok(Err(err)) => {
                debug!("relay rejected rejoin: {:#}", err);
                false
            }
            Err(_) => {
                debug!("rejoin timed out after {:?}", timeout);
                false
            }
        }
    }

    /// Binds `address` to the live session after a successful rejoin.
    pub fn bind_address(&self, address: &WalletAddress) -> Result<(), RelayError> {
        let mut state = lock(&self.state);
        if state.binding.is_none() {
            return Err(RelayError::NotInitialized);
        }
        state.connected_address = Some(address.clone());
        Ok(())
    }

    pub async fn sign_message(&self, message: &str) -> Result<String, RelayError> {
        let (transport, address) = self.signing_target()?;
        match tokio::time::timeout(
            self.config.sign_timeout,
            transport.sign_message(&address, message),
        )
        .await
        {
            Ok(result) => result.map_err(RelayError::from_transport),
            Err(_) => Err(RelayError::Timeout),
        }
    }

    pub async fn sign_and_broadcast(&self, unsigned_tx_hex: &str) -> Result<String, RelayError> {
        let (transport, address) = self.signing_target()?;
        match tokio::time::timeout(
            self.config.sign_timeout,
            transport.sign_transaction(&address, unsigned_tx_hex, true),
        )
        .await
        {
            Ok(result) => result.map_err(RelayError::from_transport),
            Err(_) => Err(RelayError::Timeout),
        }
    }

    fn signing_target(&self) -> Result<(Arc<dyn RelayTransport>, WalletAddress), RelayError> {
        let state = lock(&self.state);
        match (state.binding.as_ref(), state.connected_address.as_ref()) {
            (Some(binding), Some(address)) => Ok((binding.transport.clone(), address.clone())),
            _ => Err(RelayError::NotConnected),
        }
    }

    /// Tears down the relay transport and the blockchain-query connection.
    /// Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = {
            let mut state = lock(&self.state);
            state.connected_address = None;
            state.binding.take()
        };

        match previous {
            Some(binding) => self.teardown(binding).await,
            None => self.disconnect_chain().await,
        }
    }

    async fn teardown(&self, binding: Binding) {
        binding.wait_cancel.cancel();
        binding.forwarder.abort();
        binding.transport.cancel_wait_for_wallet();
        binding.transport.disconnect().await;
        self.disconnect_chain().await;
        debug!("relay cycle {} torn down", binding.cycle);
    }

    async fn disconnect_chain(&self) {
        if let Err(err) = self.chain.disconnect().await {
            warn!(
                "failed to disconnect {} backend: {}",
                self.chain.backend_id(),
                err
            );
        }
    }

    pub fn network(&self) -> Network {
        lock(&self.state).network
    }

    pub fn connected_address(&self) -> Option<WalletAddress> {
        lock(&self.state).connected_address.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected_address.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).binding.is_some()
    }

    /// Cycle id of the live binding, if any.
    pub fn current_cycle(&self) -> Option<u64> {
        lock(&self.state).binding.as_ref().map(|binding| binding.cycle)
    }

    pub fn session_info(&self) -> Option<SessionCredentials> {
        let transport = lock(&self.state)
            .binding
            .as_ref()
            .map(|binding| binding.transport.clone())?;
        transport.session_info()
    }
}

impl Drop for RelaySessionClient {
    fn drop(&mut self) {
        if let Some(binding) = lock(&self.state).binding.take() {
            binding.wait_cancel.cancel();
            binding.forwarder.abort();
            binding.transport.cancel_wait_for_wallet();
        }
    }
}

async fn forward_events(
    cycle: u64,
    mut incoming: mpsc::UnboundedReceiver<TransportEvent>,
    outgoing: mpsc::UnboundedSender<RelayEvent>,
    state: Arc<Mutex<ClientState>>,
) {
    let mut delivered = [false; 4];

    while let Some(event) = incoming.recv().await {
        let kind = RelayEventKind::from(event);
        let slot = kind.slot();
        if delivered[slot] {
            debug!("dropping repeated {:?} in relay cycle {}", kind, cycle);
            continue;
        }
        delivered[slot] = true;

        {
            let mut guard = lock(&state);
            if guard.binding.as_ref().map(|binding| binding.cycle) != Some(cycle) {
                break;
            }
            if kind.is_teardown() {
                guard.connected_address = None;
            }
        }

        if outgoing.send(RelayEvent { cycle, kind }).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRelay, parse_pairing_uri};
    use np_chain_client::NoopChainBackend;

    const RELAY_URL: &str = "wss://relay.test";

    fn client(relay: &MemoryRelay) -> (RelaySessionClient, RelayEvents, Arc<NoopChainBackend>) {
        let chain = Arc::new(NoopChainBackend::new());
        let config = RelayClientConfig {
            relay_url: RELAY_URL.to_owned(),
            ..RelayClientConfig::default()
        };
        let (client, events) =
            RelaySessionClient::new(Arc::new(relay.clone()), chain.clone(), config, Network::Testnet);
        (client, events, chain)
    }

    fn addr(value: &str) -> WalletAddress {
        WalletAddress(value.to_owned())
    }

    #[tokio::test]
    async fn fresh_initialize_issues_pairing_uri_and_opens_chain() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, chain) = client(&relay);

        let uri = client.initialize(Network::Mainnet, None).await?;
        let creds = parse_pairing_uri(&uri).expect("well-formed pairing uri");
        assert_eq!(creds.relay_url, RELAY_URL);
        assert_eq!(client.session_info(), Some(creds));
        assert_eq!(client.network(), Network::Mainnet);

        let activity = chain.activity().await;
        assert_eq!(activity.network_name.as_deref(), Some("mainnet"));
        assert_eq!(activity.endpoint, Some(endpoint_for(Network::Mainnet)));
        Ok(())
    }

    #[tokio::test]
    async fn reinitialize_leaves_one_live_transport() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, chain) = client(&relay);

        client.initialize(Network::Testnet, None).await?;
        let first_cycle = client.current_cycle();
        client.initialize(Network::Testnet, None).await?;

        assert_eq!(relay.opened_transports(), 2);
        assert_eq!(relay.live_transports(), 1);
        assert_ne!(client.current_cycle(), first_cycle);
        assert_eq!(chain.activity().await.disconnects, 1);
        Ok(())
    }

    #[tokio::test]
    async fn wait_resolves_when_wallet_joins() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, mut events, _) = client(&relay);

        let uri = client.initialize(Network::Testnet, None).await?;
        let peer = relay.peer_for_uri(&uri)?;

        let joiner = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            peer.join(&WalletAddress("nexa:qtest123".to_owned()))
        });

        let address = client.wait_for_wallet(Duration::from_secs(5)).await?;
        joiner.await??;

        assert_eq!(address, addr("nexa:qtest123"));
        assert_eq!(client.connected_address(), Some(addr("nexa:qtest123")));

        let event = events.recv().await.expect("join event");
        assert_eq!(event.cycle, client.current_cycle().expect("live cycle"));
        assert_eq!(event.kind, RelayEventKind::PeerJoined(addr("nexa:qtest123")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_releases_listener() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, _) = client(&relay);
        client.initialize(Network::Testnet, None).await?;

        let result = client.wait_for_wallet(Duration::from_secs(60)).await;

        assert!(matches!(result, Err(RelayError::Timeout)));
        assert_eq!(relay.pending_waiters(), 0);
        assert!(client.connected_address().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn wait_without_initialize_fails() {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, _) = client(&relay);
        let result = client.wait_for_wallet(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RelayError::NotInitialized)));
    }

    #[tokio::test]
    async fn cancelled_wait_ignores_a_late_join() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, _) = client(&relay);
        let client = Arc::new(client);

        let uri = client.initialize(Network::Testnet, None).await?;
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.wait_for_wallet(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;

        client.cancel_wait_for_wallet();
        relay.peer_for_uri(&uri)?.join(&addr("nexa:qlate"))?;

        let result = waiter.await?;
        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert!(client.connected_address().is_none());
        assert_eq!(relay.pending_waiters(), 0);

        // Still usable for the next cycle.
        let uri = client.initialize(Network::Testnet, None).await?;
        relay.peer_for_uri(&uri)?.join(&addr("nexa:qnext"))?;
        let address = client.wait_for_wallet(Duration::from_secs(5)).await?;
        assert_eq!(address, addr("nexa:qnext"));
        Ok(())
    }

    #[tokio::test]
    async fn rejoin_reports_liveness_as_bool() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, _) = client(&relay);
        assert!(!client.rejoin_session(Duration::from_secs(1)).await);

        let uri = client.initialize(Network::Testnet, None).await?;
        let peer = relay.peer_for_uri(&uri)?;
        peer.join(&addr("nexa:qA"))?;
        let creds = client.session_info().expect("fresh session has credentials");

        client.initialize(Network::Testnet, Some(&creds)).await?;
        assert!(client.rejoin_session(Duration::from_secs(1)).await);

        peer.set_alive(false)?;
        assert!(!client.rejoin_session(Duration::from_secs(1)).await);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_rejoin_times_out_to_false() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, _) = client(&relay);
        client.initialize(Network::Testnet, None).await?;

        relay.set_stall_rejoin(true);
        assert!(!client.rejoin_session(Duration::from_secs(5)).await);
        Ok(())
    }

    #[tokio::test]
    async fn signing_requires_a_bound_wallet() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, _) = client(&relay);

        assert!(matches!(
            client.sign_message("hello").await,
            Err(RelayError::NotConnected)
        ));

        let uri = client.initialize(Network::Testnet, None).await?;
        assert!(matches!(
            client.sign_and_broadcast("00ff").await,
            Err(RelayError::NotConnected)
        ));

        relay.peer_for_uri(&uri)?.join(&addr("nexa:qsigner"))?;
        client.wait_for_wallet(Duration::from_secs(5)).await?;

        let first = client.sign_message("hello").await?;
        let second = client.sign_message("hello").await?;
        assert!(!first.is_empty());
        assert_eq!(first, second);

        let tx_id = client.sign_and_broadcast("00ff").await?;
        assert_eq!(tx_id.len(), 64);
        Ok(())
    }

    #[tokio::test]
    async fn teardown_events_arrive_once_and_unbind() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, mut events, _) = client(&relay);

        let uri = client.initialize(Network::Testnet, None).await?;
        let peer = relay.peer_for_uri(&uri)?;
        peer.join(&addr("nexa:qA"))?;
        client.wait_for_wallet(Duration::from_secs(5)).await?;
        let cycle = client.current_cycle().expect("live cycle");

        peer.disconnect()?;
        peer.disconnect()?;
        peer.delete_session()?;

        let kinds: Vec<_> = [
            events.recv().await.expect("join"),
            events.recv().await.expect("disconnect"),
            events.recv().await.expect("delete"),
        ]
        .into_iter()
        .map(|event| {
            assert_eq!(event.cycle, cycle);
            event.kind
        })
        .collect();

        assert_eq!(
            kinds,
            vec![
                RelayEventKind::PeerJoined(addr("nexa:qA")),
                RelayEventKind::PeerDisconnected,
                RelayEventKind::SessionDeleted,
            ]
        );
        assert!(events.try_recv().is_err(), "duplicate disconnect suppressed");
        assert!(client.connected_address().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn stale_cycle_events_stop_after_reinitialize() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, mut events, _) = client(&relay);

        let uri = client.initialize(Network::Testnet, None).await?;
        let old_peer = relay.peer_for_uri(&uri)?;
        client.initialize(Network::Testnet, None).await?;

        old_peer.close()?;
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() -> anyhow::Result<()> {
        let relay = MemoryRelay::new(RELAY_URL);
        let (client, _events, chain) = client(&relay);

        client.disconnect().await;
        client.initialize(Network::Testnet, None).await?;
        client.disconnect().await;
        client.disconnect().await;

        assert!(!client.is_initialized());
        assert_eq!(relay.live_transports(), 0);
        assert!(!chain.is_connected().await);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_relay_leaves_nothing_open() {
        let relay = MemoryRelay::new(RELAY_URL);
        relay.set_unreachable(true);
        let (client, _events, chain) = client(&relay);

        let result = client.initialize(Network::Testnet, None).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
        assert!(!client.is_initialized());
        assert_eq!(relay.live_transports(), 0);
        assert!(!chain.is_connected().await);
    }
}
