use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use np_api_types::{DAppInfo, SessionCredentials, WalletAddress};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::{RelayConnector, RelayTarget, RelayTimeout, RelayTransport, TransportEvent};

pub const MEMORY_PROTOCOL_VERSION: &str = "1";

const URI_PREFIX: &str = "nexa-pair:";

#[derive(Default)]
struct HubState {
    sessions: HashMap<String, SessionRecord>,
    transports: HashMap<u64, TransportSlot>,
    next_transport_id: u64,
    opened: usize,
    unreachable: bool,
    stall_rejoin: bool,
    last_session_id: Option<String>,
}

struct SessionRecord {
    credentials: SessionCredentials,
    dapp_name: String,
    wallet: Option<WalletAddress>,
    wallet_alive: bool,
    deleted: bool,
}

#[derive(Default)]
struct TransportSlot {
    session_id: Option<String>,
    subscribers: Vec<mpsc::UnboundedSender<TransportEvent>>,
    waiter: Option<oneshot::Sender<WalletAddress>>,
}

impl HubState {
    fn broadcast(&mut self, session_id: &str, event: &TransportEvent) {
        for slot in self
            .transports
            .values_mut()
            .filter(|slot| slot.session_id.as_deref() == Some(session_id))
        {
            slot.subscribers
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }
}

fn lock(hub: &Mutex<HubState>) -> MutexGuard<'_, HubState> {
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process pairing relay.
///
/// The DApp side connects through [`RelayConnector`]; the wallet side is
/// driven through [`MemoryPeer`] handles. Used by the test suites and by the
/// demo service, where no external relay is available.
#[derive(Clone)]
pub struct MemoryRelay {
    relay_url: String,
    hub: Arc<Mutex<HubState>>,
}

impl MemoryRelay {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            hub: Arc::new(Mutex::new(HubState::default())),
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn peer(&self, session_id: &str) -> MemoryPeer {
        MemoryPeer {
            session_id: session_id.to_owned(),
            hub: self.hub.clone(),
        }
    }

    pub fn peer_for_uri(&self, pairing_uri: &str) -> Result<MemoryPeer> {
        let creds = parse_pairing_uri(pairing_uri)
            .ok_or_else(|| anyhow!("not a pairing uri: {pairing_uri}"))?;
        Ok(self.peer(&creds.session_id))
    }

    pub fn last_session_id(&self) -> Option<String> {
        lock(&self.hub).last_session_id.clone()
    }

    pub fn session_dapp(&self, session_id: &str) -> Option<String> {
        lock(&self.hub)
            .sessions
            .get(session_id)
            .map(|record| record.dapp_name.clone())
    }

    /// Transports opened and not yet disconnected.
    pub fn live_transports(&self) -> usize {
        lock(&self.hub).transports.len()
    }

    pub fn opened_transports(&self) -> usize {
        lock(&self.hub).opened
    }

    pub fn pending_waiters(&self) -> usize {
        lock(&self.hub)
            .transports
            .values()
            .filter(|slot| slot.waiter.is_some())
            .count()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.hub).unreachable = unreachable;
    }

    /// Makes every rejoin probe hang until its timeout.
    pub fn set_stall_rejoin(&self, stall: bool) {
        lock(&self.hub).stall_rejoin = stall;
    }
}

impl RelayConnector for MemoryRelay {
    fn open(&self, target: RelayTarget, dapp: &DAppInfo) -> Result<Arc<dyn RelayTransport>> {
        let mut hub = lock(&self.hub);
        hub.next_transport_id += 1;
        hub.opened += 1;
        let id = hub.next_transport_id;
        hub.transports.insert(id, TransportSlot::default());

        Ok(Arc::new(MemoryTransport {
            id,
            hub: self.hub.clone(),
            target,
            dapp_name: dapp.name.clone(),
        }))
    }
}

struct MemoryTransport {
    id: u64,
    hub: Arc<Mutex<HubState>>,
    target: RelayTarget,
    dapp_name: String,
}

impl MemoryTransport {
    fn session_id(&self) -> Option<String> {
        lock(&self.hub)
            .transports
            .get(&self.id)
            .and_then(|slot| slot.session_id.clone())
    }

    fn ensure_paired(&self, address: &WalletAddress) -> Result<()> {
        let hub = lock(&self.hub);
        let session_id = hub
            .transports
            .get(&self.id)
            .and_then(|slot| slot.session_id.as_deref())
            .ok_or_else(|| anyhow!("transport has no session"))?;
        let record = hub
            .sessions
            .get(session_id)
            .ok_or_else(|| anyhow!("unknown session {session_id}"))?;

        if record.deleted || !record.wallet_alive || record.wallet.as_ref() != Some(address) {
            bail!("wallet {address} is not paired on session {session_id}");
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        let mut guard = lock(&self.hub);
        let hub = &mut *guard;
        if hub.unreachable {
            bail!("relay unreachable");
        }
        let slot = hub
            .transports
            .get_mut(&self.id)
            .ok_or_else(|| anyhow!("transport {} already closed", self.id))?;

        if let RelayTarget::Resume(creds) = &self.target {
            if let Some(record) = hub.sessions.get(&creds.session_id) {
                if record.credentials.secret != creds.secret {
                    bail!("secret mismatch for session {}", creds.session_id);
                }
            }
            slot.session_id = Some(creds.session_id.clone());
        }
        Ok(())
    }

    async fn create_session(&self) -> Result<()> {
        let relay_url = match &self.target {
            RelayTarget::Fresh { relay_url } => relay_url.clone(),
            RelayTarget::Resume(_) => bail!("resumed transports cannot create sessions"),
        };

        let credentials = SessionCredentials {
            session_id: Uuid::new_v4().simple().to_string(),
            secret: Uuid::new_v4().simple().to_string(),
            relay_url,
            version: MEMORY_PROTOCOL_VERSION.to_owned(),
        };
        let session_id = credentials.session_id.clone();

        let mut guard = lock(&self.hub);
        let hub = &mut *guard;
        let slot = hub
            .transports
            .get_mut(&self.id)
            .ok_or_else(|| anyhow!("transport {} already closed", self.id))?;
        slot.session_id = Some(session_id.clone());
        hub.sessions.insert(
            session_id.clone(),
            SessionRecord {
                credentials,
                dapp_name: self.dapp_name.clone(),
                wallet: None,
                wallet_alive: false,
                deleted: false,
            },
        );
        hub.last_session_id = Some(session_id);
        Ok(())
    }

    fn pairing_uri(&self) -> String {
        self.session_info()
            .map(|creds| format_pairing_uri(&creds))
            .unwrap_or_default()
    }

    fn session_info(&self) -> Option<SessionCredentials> {
        let session_id = self.session_id()?;
        let known = lock(&self.hub)
            .sessions
            .get(&session_id)
            .map(|record| record.credentials.clone());
        match (known, &self.target) {
            (Some(creds), _) => Some(creds),
            (None, RelayTarget::Resume(creds)) => Some(creds.clone()),
            (None, RelayTarget::Fresh { .. }) => None,
        }
    }

    async fn wait_for_wallet(&self, timeout: Duration) -> Result<WalletAddress> {
        let receiver = {
            let mut guard = lock(&self.hub);
            let hub = &mut *guard;
            let slot = hub
                .transports
                .get_mut(&self.id)
                .ok_or_else(|| anyhow!("transport {} already closed", self.id))?;
            let session_id = slot
                .session_id
                .clone()
                .ok_or_else(|| anyhow!("no session to wait on"))?;

            if let Some(record) = hub.sessions.get(&session_id) {
                if record.wallet_alive && !record.deleted {
                    if let Some(address) = record.wallet.clone() {
                        return Ok(address);
                    }
                }
            }

            let (sender, receiver) = oneshot::channel();
            slot.waiter = Some(sender);
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(address)) => Ok(address),
            Ok(Err(_)) => bail!("wait for wallet cancelled"),
            Err(_) => {
                self.cancel_wait_for_wallet();
                Err(RelayTimeout.into())
            }
        }
    }

    fn cancel_wait_for_wallet(&self) {
        if let Some(slot) = lock(&self.hub).transports.get_mut(&self.id) {
            slot.waiter = None;
        }
    }

    async fn rejoin_session(&self, timeout: Duration) -> Result<bool> {
        let (stall, alive) = {
            let hub = lock(&self.hub);
            let alive = hub
                .transports
                .get(&self.id)
                .and_then(|slot| slot.session_id.as_deref())
                .and_then(|session_id| hub.sessions.get(session_id))
                .map(|record| record.wallet_alive && !record.deleted && record.wallet.is_some())
                .unwrap_or(false);
            (hub.stall_rejoin, alive)
        };

        if stall {
            tokio::time::sleep(timeout).await;
            return Err(RelayTimeout.into());
        }
        Ok(alive)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(slot) = lock(&self.hub).transports.get_mut(&self.id) {
            slot.subscribers.push(sender);
        }
        receiver
    }

    async fn sign_message(&self, address: &WalletAddress, message: &str) -> Result<String> {
        self.ensure_paired(address)?;
        let digest = Sha256::digest(format!("{address}:{message}").as_bytes());
        Ok(hex_lower(&digest))
    }

    async fn sign_transaction(
        &self,
        address: &WalletAddress,
        unsigned_tx_hex: &str,
        broadcast: bool,
    ) -> Result<String> {
        self.ensure_paired(address)?;
        if unsigned_tx_hex.trim().is_empty() {
            bail!("transaction hex cannot be empty");
        }
        let digest = Sha256::digest(unsigned_tx_hex.as_bytes());
        let tx_id = hex_lower(&digest);
        if broadcast {
            Ok(tx_id)
        } else {
            Ok(format!("signed:{tx_id}"))
        }
    }

    async fn disconnect(&self) {
        if lock(&self.hub).transports.remove(&self.id).is_some() {
            debug!("memory relay transport {} closed", self.id);
        }
    }
}

/// Wallet-side handle on one relay session.
#[derive(Clone)]
pub struct MemoryPeer {
    session_id: String,
    hub: Arc<Mutex<HubState>>,
}

impl MemoryPeer {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut HubState) -> R) -> Result<R> {
        let mut hub = lock(&self.hub);
        if !hub.sessions.contains_key(&self.session_id) {
            bail!("unknown session {}", self.session_id);
        }
        Ok(f(&mut *hub))
    }

    /// Completes pairing as `address`, resolving any pending wait.
    pub fn join(&self, address: &WalletAddress) -> Result<()> {
        let session_id = self.session_id.clone();
        let mut guard = lock(&self.hub);
        let hub = &mut *guard;
        let record = hub
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| anyhow!("unknown session {session_id}"))?;
        if record.deleted {
            bail!("session {session_id} was deleted");
        }
        record.wallet = Some(address.clone());
        record.wallet_alive = true;

        for slot in hub
            .transports
            .values_mut()
            .filter(|slot| slot.session_id.as_deref() == Some(session_id.as_str()))
        {
            if let Some(waiter) = slot.waiter.take() {
                let _ = waiter.send(address.clone());
            }
        }
        hub.broadcast(&session_id, &TransportEvent::WalletJoined(address.clone()));
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        let session_id = self.session_id.clone();
        self.with_session(|hub| {
            if let Some(record) = hub.sessions.get_mut(&session_id) {
                record.wallet_alive = false;
            }
            hub.broadcast(&session_id, &TransportEvent::PeerDisconnected);
        })
    }

    pub fn close(&self) -> Result<()> {
        let session_id = self.session_id.clone();
        self.with_session(|hub| hub.broadcast(&session_id, &TransportEvent::Closed))
    }

    pub fn delete_session(&self) -> Result<()> {
        let session_id = self.session_id.clone();
        self.with_session(|hub| {
            if let Some(record) = hub.sessions.get_mut(&session_id) {
                record.deleted = true;
                record.wallet_alive = false;
            }
            hub.broadcast(&session_id, &TransportEvent::SessionDeleted);
        })
    }

    /// Sets whether the wallet answers rejoin probes.
    pub fn set_alive(&self, alive: bool) -> Result<()> {
        let session_id = self.session_id.clone();
        self.with_session(|hub| {
            if let Some(record) = hub.sessions.get_mut(&session_id) {
                record.wallet_alive = alive;
            }
        })
    }
}

/// `nexa-pair:<sessionId>@<version>?relay=<url>&key=<secret>`
fn format_pairing_uri(creds: &SessionCredentials) -> String {
    format!(
        "{URI_PREFIX}{}@{}?relay={}&key={}",
        creds.session_id, creds.version, creds.relay_url, creds.secret
    )
}

pub fn parse_pairing_uri(uri: &str) -> Option<SessionCredentials> {
    let rest = uri.strip_prefix(URI_PREFIX)?;
    let (head, query) = rest.split_once('?')?;
    let (session_id, version) = head.split_once('@')?;
    let query = query.strip_prefix("relay=")?;
    let (relay_url, secret) = query.rsplit_once("&key=")?;

    SessionCredentials::from_parts(
        Some(session_id),
        Some(secret),
        Some(relay_url),
        Some(version),
    )
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
