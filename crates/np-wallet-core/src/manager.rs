use crate::{ManagerConfig, WalletError};
use np_api_types::{
    ConnectionSnapshot, ConnectionStatus, Network, SessionCredentials, WalletAddress,
};
use np_relay::{RelayEvent, RelayEventKind, RelayEvents, RelaySessionClient};
use np_storage::{KeyValueStore, SessionStore};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered snapshots per subscriber before it starts lagging.
pub const SNAPSHOT_CAPACITY: usize = 64;

/// Remembers whether session restore has already run. Clones share the flag,
/// so a manager rebuilt with the same guard will not restore twice.
#[derive(Debug, Clone, Default)]
pub struct RestoreGuard(Arc<AtomicBool>);

impl RestoreGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Restoring,
    /// Notifications from `outgoing_cycle` or older belong to the binding
    /// being replaced and must not disturb the switch.
    Switching { outgoing_cycle: Option<u64> },
}

#[derive(Clone)]
struct Operation {
    id: u64,
    token: CancellationToken,
}

struct ManagerState {
    status: ConnectionStatus,
    address: Option<WalletAddress>,
    network: Network,
    pairing_uri: Option<String>,
    error: Option<String>,
    phase: Phase,
    operation: Option<Operation>,
}

impl ManagerState {
    fn settle_disconnected(&mut self, error: Option<String>) {
        self.status = ConnectionStatus::Disconnected;
        self.address = None;
        self.pairing_uri = None;
        self.error = error;
        self.phase = Phase::Idle;
    }

    fn settle_connected(&mut self, address: &WalletAddress, network: Network) {
        self.status = ConnectionStatus::Connected;
        self.address = Some(address.clone());
        self.network = network;
        self.pairing_uri = None;
        self.error = None;
        self.phase = Phase::Idle;
    }
}

pub struct WalletConnectionManager<S> {
    client: RelaySessionClient,
    store: SessionStore<S>,
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    snapshots: broadcast::Sender<ConnectionSnapshot>,
    restore_guard: RestoreGuard,
    operations: AtomicU64,
}

impl<S> WalletConnectionManager<S>
where
    S: KeyValueStore + 'static,
{
    pub fn new(
        client: RelaySessionClient,
        events: RelayEvents,
        store: SessionStore<S>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Self::with_restore_guard(client, events, store, config, RestoreGuard::new())
    }

    /// Builds a manager that shares its restore-once flag with `restore_guard`.
    /// Spawns the relay event pump, so it must run inside a Tokio runtime.
    pub fn with_restore_guard(
        client: RelaySessionClient,
        events: RelayEvents,
        store: SessionStore<S>,
        config: ManagerConfig,
        restore_guard: RestoreGuard,
    ) -> Arc<Self> {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        let network = config.initial_network;
        let manager = Arc::new(Self {
            client,
            store,
            config,
            state: Mutex::new(ManagerState {
                status: ConnectionStatus::Disconnected,
                address: None,
                network,
                pairing_uri: None,
                error: None,
                phase: Phase::Idle,
                operation: None,
            }),
            snapshots,
            restore_guard,
            operations: AtomicU64::new(0),
        });
        tokio::spawn(pump_events(Arc::downgrade(&manager), events));
        manager
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn session_store(&self) -> &SessionStore<S> {
        &self.store
    }

    pub fn restore_guard(&self) -> &RestoreGuard {
        &self.restore_guard
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.lock_state();
        self.build_snapshot(&state)
    }

    /// Every later transition is delivered to the receiver in order.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn has_stored_session(&self) -> bool {
        self.store.has_stored_session()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().status == ConnectionStatus::Connected
    }

    /// Starts a fresh pairing on `network` and waits for a wallet to join.
    ///
    /// A newer `connect`, `switch_to_account`, `cancel_connection` or
    /// `disconnect` supersedes this attempt; it then returns
    /// [`WalletError::Cancelled`] and leaves the state to whoever took over.
    pub async fn connect(&self, network: Network) -> Result<WalletAddress, WalletError> {
        let operation = self.begin_operation(Phase::Connecting, network);
        let result = self.run_connect(network, &operation).await;
        self.finish_operation(&operation);
        result
    }

    async fn run_connect(
        &self,
        network: Network,
        operation: &Operation,
    ) -> Result<WalletAddress, WalletError> {
        let outcome = async {
            let pairing_uri = self.client.initialize(network, None).await?;
            {
                let mut state = self.lock_state();
                if operation.token.is_cancelled() {
                    return Err(WalletError::Cancelled);
                }
                state.pairing_uri = Some(pairing_uri);
                self.publish(&state);
            }

            tokio::select! {
                biased;
                _ = operation.token.cancelled() => Err(WalletError::Cancelled),
                result = self.client.wait_for_wallet(self.config.pairing_timeout) => {
                    result.map_err(WalletError::from)
                }
            }
        }
        .await;

        let mut state = self.lock_state();
        if operation.token.is_cancelled() {
            return Err(WalletError::Cancelled);
        }

        match outcome {
            Ok(address) => {
                let credentials = self.client.session_info();
                self.store
                    .save_session(&address, network, None, credentials.as_ref());
                self.store
                    .add_recent_connection(&address, network, credentials.as_ref(), None);
                state.settle_connected(&address, network);
                self.publish(&state);
                info!("wallet {} connected on {}", address, network);
                Ok(address)
            }
            Err(WalletError::Cancelled) => Err(WalletError::Cancelled),
            Err(err) => {
                warn!("wallet connection on {} failed: {}", network, err);
                state.settle_disconnected(Some(err.to_string()));
                self.publish(&state);
                Err(err)
            }
        }
    }

    /// Abandons an in-flight connect or restore. Does nothing otherwise.
    pub fn cancel_connection(&self) {
        let mut state = self.lock_state();
        if state.status != ConnectionStatus::Connecting {
            debug!("cancel ignored while {:?}", state.status);
            return;
        }
        if let Some(operation) = state.operation.take() {
            operation.token.cancel();
        }
        self.client.cancel_wait_for_wallet();
        state.settle_disconnected(None);
        self.publish(&state);
        info!("wallet connection cancelled");
    }

    /// Tears down the relay connection and forgets the persisted session.
    /// Recent connections are kept.
    pub async fn disconnect(&self) {
        if let Some(operation) = self.lock_state().operation.take() {
            operation.token.cancel();
        }

        self.client.disconnect().await;

        let mut state = self.lock_state();
        self.store.end_session();
        state.settle_disconnected(None);
        self.publish(&state);
        info!("wallet disconnected");
    }

    /// Resumes the persisted session if it is fresh and the wallet answers.
    ///
    /// Runs at most once per [`RestoreGuard`]; later calls return `false`
    /// without touching anything.
    pub async fn attempt_session_restore(&self) -> bool {
        if !self.restore_guard.claim() {
            debug!("session restore already attempted");
            return false;
        }

        match self.restore_session().await {
            Ok(restored) => restored,
            Err(err) => {
                debug!("session restore skipped: {}", err);
                false
            }
        }
    }

    async fn restore_session(&self) -> Result<bool, WalletError> {
        let Some(session) = self.store.session() else {
            return Ok(false);
        };
        if self.store.is_expired(&session) {
            return Err(WalletError::Expired);
        }
        let Some(credentials) = session.credentials() else {
            self.store.end_session();
            return Err(WalletError::MalformedCredentials);
        };
        if self.lock_state().status != ConnectionStatus::Disconnected {
            return Ok(false);
        }

        let operation = self.begin_operation(Phase::Restoring, session.network);
        let alive = self
            .resume_and_probe(session.network, &credentials, &operation)
            .await;

        let restored = {
            let mut state = self.lock_state();
            if operation.token.is_cancelled() {
                false
            } else {
                match alive {
                    Ok(true) => match self.client.bind_address(&session.address) {
                        Ok(()) => {
                            self.store.add_recent_connection(
                                &session.address,
                                session.network,
                                Some(&credentials),
                                None,
                            );
                            state.settle_connected(&session.address, session.network);
                            self.publish(&state);
                            info!("restored session for wallet {}", session.address);
                            true
                        }
                        Err(err) => {
                            debug!("could not bind restored wallet: {}", err);
                            self.store.end_session();
                            state.settle_disconnected(None);
                            self.publish(&state);
                            false
                        }
                    },
                    Ok(false) | Err(_) => {
                        info!("stored session for {} is gone", session.address);
                        self.store.end_session();
                        state.settle_disconnected(None);
                        self.publish(&state);
                        false
                    }
                }
            }
        };

        self.finish_operation(&operation);
        Ok(restored)
    }

    /// Re-opens the channel for `credentials` and asks whether the wallet is
    /// still on the other end.
    async fn resume_and_probe(
        &self,
        network: Network,
        credentials: &SessionCredentials,
        operation: &Operation,
    ) -> Result<bool, WalletError> {
        self.client.initialize(network, Some(credentials)).await?;

        tokio::select! {
            biased;
            _ = operation.token.cancelled() => return Err(WalletError::Cancelled),
            _ = tokio::time::sleep(self.config.rejoin_settle) => {}
        }

        Ok(self.client.rejoin_session(self.config.rejoin_timeout).await)
    }

    /// Moves the connection to a previously used wallet.
    ///
    /// Tries to resume the stored relay session first and falls back to a
    /// fresh pairing when the wallet no longer answers.
    pub async fn switch_to_account(
        &self,
        address: &WalletAddress,
        network: Network,
    ) -> Result<(), WalletError> {
        {
            let state = self.lock_state();
            if state.address.as_ref() == Some(address) && state.network == network {
                debug!("already on {} ({})", address, network);
                return Ok(());
            }
        }

        let outgoing_cycle = self.client.current_cycle();
        let operation = self.begin_operation(Phase::Switching { outgoing_cycle }, network);
        let result = self.run_switch(address, network, &operation).await;
        self.finish_operation(&operation);
        result
    }

    async fn run_switch(
        &self,
        address: &WalletAddress,
        network: Network,
        operation: &Operation,
    ) -> Result<(), WalletError> {
        let Some(entry) = self.store.recent_connection(address) else {
            let err = WalletError::NotFound(address.to_string());
            let mut state = self.lock_state();
            if operation.token.is_cancelled() {
                return Err(WalletError::Cancelled);
            }
            state.settle_disconnected(Some(err.to_string()));
            self.publish(&state);
            return Err(err);
        };

        if let Some(credentials) = entry.credentials() {
            match self.resume_and_probe(network, &credentials, operation).await {
                Ok(true) => {
                    let mut state = self.lock_state();
                    if operation.token.is_cancelled() {
                        return Err(WalletError::Cancelled);
                    }
                    self.client.bind_address(address)?;
                    self.store
                        .save_session(address, network, None, Some(&credentials));
                    self.store
                        .add_recent_connection(address, network, Some(&credentials), None);
                    state.settle_connected(address, network);
                    self.publish(&state);
                    info!("switched to wallet {} on {}", address, network);
                    return Ok(());
                }
                Ok(false) => info!("wallet {} did not answer rejoin, pairing again", address),
                Err(WalletError::Cancelled) => return Err(WalletError::Cancelled),
                Err(err) => warn!("could not resume session for {}: {}", address, err),
            }
        }

        if operation.token.is_cancelled() {
            return Err(WalletError::Cancelled);
        }
        self.store.end_session();
        self.run_connect(network, operation).await.map(|_| ())
    }

    pub async fn sign_message(&self, message: &str) -> Result<String, WalletError> {
        Ok(self.client.sign_message(message).await?)
    }

    pub async fn sign_and_broadcast(&self, unsigned_tx_hex: &str) -> Result<String, WalletError> {
        Ok(self.client.sign_and_broadcast(unsigned_tx_hex).await?)
    }

    fn handle_relay_event(&self, event: RelayEvent) {
        let current_cycle = self.client.current_cycle();
        let mut state = self.lock_state();

        if let RelayEventKind::PeerJoined(address) = &event.kind {
            match (&state.status, state.address.as_ref()) {
                (ConnectionStatus::Connected, Some(bound)) if bound == address => {
                    debug!("wallet {} announced itself again", address);
                }
                (ConnectionStatus::Connected, bound) => {
                    warn!("ignoring join from {} while bound to {:?}", address, bound);
                }
                _ => debug!("join from {} left to the pending wait", address),
            }
            return;
        }

        if let Phase::Switching { outgoing_cycle } = state.phase {
            if outgoing_cycle.is_some_and(|outgoing| event.cycle <= outgoing) {
                debug!(
                    "suppressing {:?} from replaced relay cycle {}",
                    event.kind, event.cycle
                );
                return;
            }
        }
        if current_cycle != Some(event.cycle) {
            debug!("dropping {:?} from stale relay cycle {}", event.kind, event.cycle);
            return;
        }
        if state.status != ConnectionStatus::Connected || state.phase != Phase::Idle {
            debug!("ignoring {:?} during {:?}", event.kind, state.phase);
            return;
        }

        info!("relay ended the wallet session: {:?}", event.kind);
        state.settle_disconnected(None);
        self.publish(&state);
    }

    /// Supersedes any in-flight operation and enters `phase` as `connecting`.
    fn begin_operation(&self, phase: Phase, network: Network) -> Operation {
        let operation = Operation {
            id: self.operations.fetch_add(1, Ordering::SeqCst) + 1,
            token: CancellationToken::new(),
        };

        let mut state = self.lock_state();
        if let Some(previous) = state.operation.replace(operation.clone()) {
            previous.token.cancel();
        }
        state.phase = phase;
        state.status = ConnectionStatus::Connecting;
        state.network = network;
        state.pairing_uri = None;
        state.error = None;
        self.publish(&state);
        operation
    }

    fn finish_operation(&self, operation: &Operation) {
        let mut state = self.lock_state();
        if state.operation.as_ref().map(|current| current.id) == Some(operation.id) {
            state.operation = None;
            state.phase = Phase::Idle;
        }
    }

    fn build_snapshot(&self, state: &ManagerState) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: state.status,
            address: state.address.clone(),
            network: state.network,
            pairing_uri: state.pairing_uri.clone(),
            error: state.error.clone(),
            // No balance source is wired in.
            balance: 0,
            is_connected: state.status == ConnectionStatus::Connected,
            has_stored_session: self.store.has_stored_session(),
        }
    }

    fn publish(&self, state: &ManagerState) {
        // Nobody listening is fine.
        let _ = self.snapshots.send(self.build_snapshot(state));
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn pump_events<S>(manager: Weak<WalletConnectionManager<S>>, mut events: RelayEvents)
where
    S: KeyValueStore + 'static,
{
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_relay_event(event);
    }
}
