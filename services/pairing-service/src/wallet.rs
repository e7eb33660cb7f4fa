use axum::{Json, extract::State};
use np_api_types::{
    ConnectRequest, ConnectionSnapshot, SignAndBroadcastRequest, SignAndBroadcastResponse,
    SignMessageRequest, SignMessageResponse, SwitchAccountRequest, WalletAddress,
};
use np_wallet_core::WalletError;
use std::future::Future;
use tokio::sync::broadcast::error::RecvError;

use crate::{AppState, ApiResult, bad_request, conflict, internal_error, wallet_error};

pub(crate) async fn wallet_state(State(state): State<AppState>) -> Json<ConnectionSnapshot> {
    Json(state.manager.snapshot())
}

pub(crate) async fn wallet_connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<ConnectionSnapshot> {
    let manager = state.manager.clone();
    drive(&state, async move {
        manager.connect(request.network).await.map(|_| ())
    })
    .await
}

pub(crate) async fn wallet_switch(
    State(state): State<AppState>,
    Json(request): Json<SwitchAccountRequest>,
) -> ApiResult<ConnectionSnapshot> {
    if request.address.trim().is_empty() {
        return Err(bad_request("address is required"));
    }

    let manager = state.manager.clone();
    let address = WalletAddress(request.address);
    drive(&state, async move {
        manager.switch_to_account(&address, request.network).await
    })
    .await
}

pub(crate) async fn wallet_disconnect(State(state): State<AppState>) -> Json<ConnectionSnapshot> {
    state.manager.disconnect().await;
    Json(state.manager.snapshot())
}

pub(crate) async fn wallet_cancel(State(state): State<AppState>) -> Json<ConnectionSnapshot> {
    state.manager.cancel_connection();
    Json(state.manager.snapshot())
}

pub(crate) async fn wallet_sign_message(
    State(state): State<AppState>,
    Json(request): Json<SignMessageRequest>,
) -> ApiResult<SignMessageResponse> {
    if request.message.is_empty() {
        return Err(bad_request("message cannot be empty"));
    }

    let address = state
        .manager
        .snapshot()
        .address
        .ok_or_else(|| conflict("no wallet connected"))?;
    let signature = state
        .manager
        .sign_message(&request.message)
        .await
        .map_err(wallet_error)?;

    Ok(Json(SignMessageResponse {
        address: address.0,
        signature,
    }))
}

pub(crate) async fn wallet_sign_and_broadcast(
    State(state): State<AppState>,
    Json(request): Json<SignAndBroadcastRequest>,
) -> ApiResult<SignAndBroadcastResponse> {
    if request.tx_hex.trim().is_empty() {
        return Err(bad_request("tx_hex cannot be empty"));
    }

    let tx_id = state
        .manager
        .sign_and_broadcast(request.tx_hex.trim())
        .await
        .map_err(wallet_error)?;

    Ok(Json(SignAndBroadcastResponse { tx_id }))
}

/// Runs `operation` in the background and answers as soon as it either
/// finishes or publishes a pairing URI the user has to scan.
async fn drive<F>(state: &AppState, operation: F) -> ApiResult<ConnectionSnapshot>
where
    F: Future<Output = Result<(), WalletError>> + Send + 'static,
{
    let mut snapshots = state.manager.subscribe();
    let mut task = tokio::spawn(operation);

    let pairing = async {
        loop {
            match snapshots.recv().await {
                Ok(snapshot) if snapshot.pairing_uri.is_some() => return Some(snapshot),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    };

    tokio::select! {
        biased;
        joined = &mut task => match joined {
            Ok(Ok(())) => Ok(Json(state.manager.snapshot())),
            Ok(Err(err)) => Err(wallet_error(err)),
            Err(err) => Err(internal_error(err)),
        },
        Some(snapshot) = pairing => Ok(Json(snapshot)),
    }
}
