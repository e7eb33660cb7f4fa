use np_api_types::{Network, SessionCredentials, WalletAddress};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Clock, JsonStore, KeyValueStore, SystemClock};

pub const SESSION_KEY: &str = "swap-demo-session";
pub const RECENT_CONNECTIONS_KEY: &str = "swap-demo-recent-connections";
pub const PUBKEYS_KEY: &str = "swap-demo-pubkeys";

pub const MAX_RECENT_CONNECTIONS: usize = 10;

/// Fixed lifetime of a persisted session, counted from creation.
pub const SESSION_TTL_MS: u128 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WalletSession {
    pub address: WalletAddress,
    pub network: Network,
    #[serde(rename = "pairingURI", default, skip_serializing_if = "Option::is_none")]
    pub pairing_uri: Option<String>,
    pub timestamp: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl WalletSession {
    /// Complete rejoin material, or `None` when any part is missing.
    pub fn credentials(&self) -> Option<SessionCredentials> {
        SessionCredentials::from_parts(
            self.session_id.as_deref(),
            self.secret.as_deref(),
            self.relay_url.as_deref(),
            self.version.as_deref(),
        )
    }

    pub fn has_partial_credentials(&self) -> bool {
        let any = self.session_id.is_some()
            || self.secret.is_some()
            || self.relay_url.is_some()
            || self.version.is_some();
        any && self.credentials().is_none()
    }

    fn set_credentials(&mut self, credentials: Option<SessionCredentials>) {
        match credentials {
            Some(creds) => {
                self.session_id = Some(creds.session_id);
                self.secret = Some(creds.secret);
                self.relay_url = Some(creds.relay_url);
                self.version = Some(creds.version);
            }
            None => {
                self.session_id = None;
                self.secret = None;
                self.relay_url = None;
                self.version = None;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecentConnection {
    pub address: WalletAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub network: Network,
    pub last_connected: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RecentConnection {
    pub fn credentials(&self) -> Option<SessionCredentials> {
        SessionCredentials::from_parts(
            self.session_id.as_deref(),
            self.secret.as_deref(),
            self.relay_url.as_deref(),
            self.version.as_deref(),
        )
    }
}

/// Fields to merge into the current session. `None` leaves a field alone;
/// `pairing_uri: Some(None)` clears the stored URI.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub address: Option<WalletAddress>,
    pub network: Option<Network>,
    pub pairing_uri: Option<Option<String>>,
    pub timestamp: Option<u128>,
    pub credentials: Option<SessionCredentials>,
}

/// Typed view over the three persisted records: the current session, the
/// recent-connection list and the address to pubkey cache.
pub struct SessionStore<S> {
    store: S,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> SessionStore<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn now_ms(&self) -> u128 {
        self.clock.now_ms()
    }

    // Serializes read-modify-write cycles within this process. A poisoned
    // lock still guards nothing but `()`, so it is safe to keep going.
    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session(&self) -> Option<WalletSession> {
        self.store.get_or(SESSION_KEY, None)
    }

    pub fn save_session(
        &self,
        address: &WalletAddress,
        network: Network,
        pairing_uri: Option<&str>,
        credentials: Option<&SessionCredentials>,
    ) -> WalletSession {
        let mut session = WalletSession {
            address: address.clone(),
            network,
            pairing_uri: pairing_uri.map(ToOwned::to_owned),
            timestamp: self.clock.now_ms(),
            session_id: None,
            secret: None,
            relay_url: None,
            version: None,
        };
        session.set_credentials(credentials.cloned());

        let _guard = self.lock_writes();
        self.store.set(SESSION_KEY, &Some(&session));
        session
    }

    /// Merges `update` into the current session. Does nothing when there is none.
    pub fn update_session(&self, update: SessionUpdate) -> Option<WalletSession> {
        let _guard = self.lock_writes();
        let mut session = self.session()?;

        if let Some(address) = update.address {
            session.address = address;
        }
        if let Some(network) = update.network {
            session.network = network;
        }
        if let Some(pairing_uri) = update.pairing_uri {
            session.pairing_uri = pairing_uri;
        }
        if let Some(timestamp) = update.timestamp {
            session.timestamp = timestamp;
        }
        if let Some(credentials) = update.credentials {
            session.set_credentials(Some(credentials));
        }

        self.store.set(SESSION_KEY, &Some(&session));
        Some(session)
    }

    pub fn end_session(&self) {
        let _guard = self.lock_writes();
        self.store.clear(SESSION_KEY);
    }

    pub fn is_session_expired(&self) -> bool {
        match self.session() {
            Some(session) => self.is_expired(&session),
            None => true,
        }
    }

    pub fn is_expired(&self, session: &WalletSession) -> bool {
        self.clock.now_ms().saturating_sub(session.timestamp) > SESSION_TTL_MS
    }

    pub fn has_stored_session(&self) -> bool {
        !self.is_session_expired()
    }

    pub fn recent_connections(&self) -> Vec<RecentConnection> {
        self.store.get_or(RECENT_CONNECTIONS_KEY, Vec::new())
    }

    pub fn recent_connection(&self, address: &WalletAddress) -> Option<RecentConnection> {
        self.recent_connections()
            .into_iter()
            .find(|conn| &conn.address == address)
    }

    /// Puts `address` at the front of the recent list, replacing any earlier
    /// entry for it. A `None` nickname keeps the one already on record.
    pub fn add_recent_connection(
        &self,
        address: &WalletAddress,
        network: Network,
        credentials: Option<&SessionCredentials>,
        nickname: Option<&str>,
    ) -> Vec<RecentConnection> {
        let _guard = self.lock_writes();
        let existing = self.recent_connections();

        let kept_nickname = existing
            .iter()
            .find(|conn| &conn.address == address)
            .and_then(|conn| conn.nickname.clone());

        let mut connection = RecentConnection {
            address: address.clone(),
            nickname: nickname.map(ToOwned::to_owned).or(kept_nickname),
            network,
            last_connected: self.clock.now_ms(),
            session_id: None,
            secret: None,
            relay_url: None,
            version: None,
        };
        if let Some(creds) = credentials {
            connection.session_id = Some(creds.session_id.clone());
            connection.secret = Some(creds.secret.clone());
            connection.relay_url = Some(creds.relay_url.clone());
            connection.version = Some(creds.version.clone());
        }

        let mut updated = Vec::with_capacity(MAX_RECENT_CONNECTIONS);
        updated.push(connection);
        updated.extend(existing.into_iter().filter(|conn| &conn.address != address));
        updated.truncate(MAX_RECENT_CONNECTIONS);

        self.store.set(RECENT_CONNECTIONS_KEY, &updated);
        updated
    }

    pub fn update_connection_nickname(&self, address: &WalletAddress, nickname: &str) -> bool {
        let _guard = self.lock_writes();
        let mut connections = self.recent_connections();
        let mut found = false;
        for conn in connections.iter_mut().filter(|conn| &conn.address == address) {
            conn.nickname = Some(nickname.to_owned());
            found = true;
        }

        if found {
            self.store.set(RECENT_CONNECTIONS_KEY, &connections);
        }
        found
    }

    pub fn remove_recent_connection(&self, address: &WalletAddress) -> Vec<RecentConnection> {
        let _guard = self.lock_writes();
        let mut connections = self.recent_connections();
        connections.retain(|conn| &conn.address != address);
        self.store.set(RECENT_CONNECTIONS_KEY, &connections);
        connections
    }

    pub fn clear_recent_connections(&self) {
        let _guard = self.lock_writes();
        self.store.set(RECENT_CONNECTIONS_KEY, &Vec::<RecentConnection>::new());
    }

    pub fn save_pubkey(&self, address: &WalletAddress, pubkey: &str) {
        let _guard = self.lock_writes();
        let mut pubkeys = self.pubkeys();
        pubkeys.insert(address.0.clone(), pubkey.to_owned());
        self.store.set(PUBKEYS_KEY, &pubkeys);
    }

    pub fn pubkey(&self, address: &WalletAddress) -> Option<String> {
        self.pubkeys().remove(address.as_str())
    }

    pub fn pubkeys(&self) -> HashMap<String, String> {
        self.store.get_or(PUBKEYS_KEY, HashMap::new())
    }
}
