//! Wallet-side controls for the in-process relay, so the pairing flow can be
//! exercised without a phone.

use axum::{
    Json,
    extract::{Path, State},
};
use np_api_types::{PeerAliveRequest, PeerJoinRequest, WalletAddress};
use np_relay::MemoryPeer;
use serde::Serialize;
use tracing::info;

use crate::{AppState, ApiResult, bad_request, not_found};

#[derive(Debug, Serialize)]
pub(crate) struct CurrentPeerResponse {
    session_id: Option<String>,
    live_transports: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct PeerActionResponse {
    session_id: String,
    action: &'static str,
}

pub(crate) async fn current_peer(State(state): State<AppState>) -> Json<CurrentPeerResponse> {
    Json(CurrentPeerResponse {
        session_id: state.relay.last_session_id(),
        live_transports: state.relay.live_transports(),
    })
}

pub(crate) async fn peer_join(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<PeerJoinRequest>,
) -> ApiResult<PeerActionResponse> {
    if request.address.trim().is_empty() {
        return Err(bad_request("address is required"));
    }
    let address = WalletAddress(request.address.trim().to_owned());
    act(&state, session_id, "join", |peer| peer.join(&address))
}

pub(crate) async fn peer_disconnect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<PeerActionResponse> {
    act(&state, session_id, "disconnect", MemoryPeer::disconnect)
}

pub(crate) async fn peer_close(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<PeerActionResponse> {
    act(&state, session_id, "close", MemoryPeer::close)
}

pub(crate) async fn peer_delete(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<PeerActionResponse> {
    act(&state, session_id, "delete", MemoryPeer::delete_session)
}

pub(crate) async fn peer_alive(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<PeerAliveRequest>,
) -> ApiResult<PeerActionResponse> {
    act(&state, session_id, "alive", |peer| peer.set_alive(request.alive))
}

fn act(
    state: &AppState,
    session_id: String,
    action: &'static str,
    apply: impl FnOnce(&MemoryPeer) -> anyhow::Result<()>,
) -> ApiResult<PeerActionResponse> {
    let peer = state.relay.peer(&session_id);
    apply(&peer).map_err(|err| not_found(&err.to_string()))?;
    info!("demo peer {} on session {}", action, session_id);

    Ok(Json(PeerActionResponse { session_id, action }))
}
