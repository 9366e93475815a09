use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::config::Config;
use crate::core::{Registry, Session, TokenVault};
use crate::net::management::ManagementChannel;
use crate::net::peer::ClientPeer;

/// Shared state for the message-channel router (§4.5).
pub struct DispatchState {
    pub registry: Arc<Registry>,
    pub token_vault: Arc<TokenVault>,
    pub config: Config,
}

#[derive(Deserialize)]
struct TermHandshake {
    #[serde(rename = "accessKey")]
    access_key: String,
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct ManageHandshake {
    #[serde(rename = "accessKey")]
    access_key: String,
}

/// Builds the Axum router for the message channel, mirroring the
/// teacher's `status_server.rs` pattern (`Router::new()`, shared
/// `Arc<State>`, one route per concern) generalized from a single HTTP
/// endpoint into two WebSocket upgrade endpoints.
pub fn build_router(state: Arc<DispatchState>) -> Router {
    Router::new()
        .route("/term", get(term_upgrade))
        .route("/manage", get(manage_upgrade))
        .with_state(state)
}

fn allowed_origins(config: &Config) -> [String; 4] {
    let port = config.content_port;
    [
        format!("http://localhost:{port}"),
        format!("https://localhost:{port}"),
        format!("http://127.0.0.1:{port}"),
        format!("https://127.0.0.1:{port}"),
    ]
}

fn origin_header(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// The origin check (§4.5 step 1) is performed before the upgrade
/// completes, so a mismatched origin is rejected with a plain HTTP
/// response and the transport never becomes a WebSocket — satisfying the
/// spec's "closed immediately without reading a second frame" (§8,
/// scenario 6) without even spending a frame on it.
async fn term_upgrade(
    State(state): State<Arc<DispatchState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = origin_header(&headers);
    if !allowed_origins(&state.config).contains(&origin) {
        log::debug!("rejecting /term connection: origin {origin:?} not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let peer = ClientPeer::new(socket, origin);
        handle_term(peer, state).await;
    })
}

async fn manage_upgrade(
    State(state): State<Arc<DispatchState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = origin_header(&headers);
    if !allowed_origins(&state.config).contains(&origin) {
        log::debug!("rejecting /manage connection: origin {origin:?} not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let peer = ClientPeer::new(socket, origin);
        handle_manage(peer, state).await;
    })
}

async fn handle_term(mut peer: ClientPeer, state: Arc<DispatchState>) {
    let handshake_text = match peer.recv_text().await {
        Some(t) => t,
        None => return,
    };
    let handshake: TermHandshake = match serde_json::from_str(&handshake_text) {
        Ok(h) => h,
        Err(_) => {
            log::debug!("/term handshake rejected: not valid JSON or missing a required field");
            peer.close().await;
            return;
        }
    };

    if !state.token_vault.consume(&handshake.access_key) {
        peer.close().await;
        return;
    }

    if handshake.session_id == "new" {
        let id = state.registry.new_session_id();
        match Session::create(id.clone(), peer, state.registry.clone()) {
            Ok((session, receiver)) => {
                log::info!("session {id}: spawned");
                state.registry.register(session.clone());
                state.registry.broadcast_state_change();
                session.serve(receiver).await;
                state.registry.broadcast_state_change();
            }
            Err(e) => log::warn!("failed to spawn session {id}: {e}"),
        }
        return;
    }

    match state.registry.lookup(&handshake.session_id) {
        Some(session) if !session.peer_attached() => {
            // `attach` re-checks the precondition itself; on the rare race
            // where another connection attached first, `peer` is simply
            // dropped here, closing the underlying socket.
            if let Ok(receiver) = session.attach(peer) {
                state.registry.broadcast_state_change();
                session.serve(receiver).await;
                state.registry.broadcast_state_change();
            }
        }
        _ => {
            log::debug!(
                "/term handshake rejected: sessionID {:?} unknown or already attached",
                handshake.session_id
            );
            peer.close().await;
        }
    }
}

async fn handle_manage(mut peer: ClientPeer, state: Arc<DispatchState>) {
    let handshake_text = match peer.recv_text().await {
        Some(t) => t,
        None => return,
    };
    let handshake: ManageHandshake = match serde_json::from_str(&handshake_text) {
        Ok(h) => h,
        Err(_) => {
            log::debug!("/manage handshake rejected: not valid JSON or missing a required field");
            peer.close().await;
            return;
        }
    };

    if !state.token_vault.consume(&handshake.access_key) {
        peer.close().await;
        return;
    }

    let (handle, receiver) = peer.into_parts();
    let token = state.registry.subscribe_mgmt(handle.clone());
    log::debug!("management subscriber {token} connected");
    ManagementChannel::serve(receiver, handle, state.registry.clone()).await;
    state.registry.unsubscribe_mgmt(token);
    log::debug!("management subscriber {token} disconnected");
}
