use axum::{
    Json,
    extract::{Path, State},
};
use np_api_types::{NicknameRequest, PubkeyRequest, PubkeyResponse, WalletAddress};
use np_storage::RecentConnection;

use crate::{AppState, ApiResult, bad_request, not_found};

pub(crate) async fn list_connections(State(state): State<AppState>) -> Json<Vec<RecentConnection>> {
    Json(state.manager.session_store().recent_connections())
}

pub(crate) async fn clear_connections(State(state): State<AppState>) -> Json<Vec<RecentConnection>> {
    let sessions = state.manager.session_store();
    sessions.clear_recent_connections();
    Json(sessions.recent_connections())
}

pub(crate) async fn remove_connection(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<Vec<RecentConnection>> {
    Json(
        state
            .manager
            .session_store()
            .remove_recent_connection(&WalletAddress(address)),
    )
}

pub(crate) async fn rename_connection(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(request): Json<NicknameRequest>,
) -> ApiResult<RecentConnection> {
    let address = WalletAddress(address);
    let sessions = state.manager.session_store();

    if !sessions.update_connection_nickname(&address, request.nickname.trim()) {
        return Err(not_found("connection not found"));
    }

    sessions
        .recent_connection(&address)
        .map(Json)
        .ok_or_else(|| not_found("connection not found"))
}

pub(crate) async fn get_pubkey(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<PubkeyResponse> {
    let pubkey = state
        .manager
        .session_store()
        .pubkey(&WalletAddress(address.clone()));
    Json(PubkeyResponse { address, pubkey })
}

pub(crate) async fn put_pubkey(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(request): Json<PubkeyRequest>,
) -> ApiResult<PubkeyResponse> {
    let pubkey = request.pubkey.trim();
    if pubkey.is_empty() {
        return Err(bad_request("pubkey cannot be empty"));
    }

    state
        .manager
        .session_store()
        .save_pubkey(&WalletAddress(address.clone()), pubkey);

    Ok(Json(PubkeyResponse {
        address,
        pubkey: Some(pubkey.to_owned()),
    }))
}
