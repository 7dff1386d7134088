//! Acceptor (C7): accepts downstream WebSocket connections, creates a
//! Session Mediator on the first `authenticate`, and routes subsequent
//! commands to it.

pub mod state;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::balance::AccountFlavor;
use crate::downstream::{DownstreamCommand, DownstreamEvent};
use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "git_hash": env!("GIT_HASH"),
        "active_sessions": state.session_count(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (downstream_tx, mut downstream_rx) = mpsc::unbounded_channel::<DownstreamEvent>();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = downstream_rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let state_for_recv = state.clone();
    let downstream_tx_for_recv = downstream_tx.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut current: Option<crate::session::SessionHandle> = None;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let command: DownstreamCommand = match serde_json::from_str(&text) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            warn!(error = %e, "failed to parse downstream command");
                            continue;
                        }
                    };
                    handle_command(
                        command,
                        &mut current,
                        &state_for_recv,
                        &downstream_tx_for_recv,
                    );
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        if let Some(session) = current.take() {
            state_for_recv.evict(&session);
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }
}

fn handle_command(
    command: DownstreamCommand,
    current: &mut Option<crate::session::SessionHandle>,
    state: &Arc<AppState>,
    downstream_tx: &mpsc::UnboundedSender<DownstreamEvent>,
) {
    match command {
        DownstreamCommand::Authenticate {
            credential,
            account_flavor,
        } => {
            if let Some(previous) = current.take() {
                info!(session_id = %previous.session_id, "re-authenticating, tearing down prior session");
                state.evict(&previous);
            }
            let session_id = Uuid::new_v4().to_string();
            let flavor = AccountFlavor::from_str_opt(account_flavor.as_deref());
            let handle = crate::session::spawn(
                session_id,
                credential,
                flavor,
                state.registry.clone(),
                state.config.clone(),
                downstream_tx.clone(),
            );
            state.insert(handle.clone());
            *current = Some(handle);
        }
        DownstreamCommand::Disconnect => {
            if let Some(session) = current.take() {
                state.evict(&session);
            }
        }
        other => {
            let delivered = current.as_ref().is_some_and(|session| session.dispatch(other));
            if !delivered {
                // Either never authenticated, or the session tore itself down
                // (e.g. upstream reconnect exhaustion) without the Acceptor
                // having been told to evict it yet — either way there is no
                // live session to serve this command. Evict the stale handle
                // from the shared registry too, or `/healthz` and credential
                // lookup keep seeing a session whose actor is long gone.
                if let Some(session) = current.take() {
                    warn!(session_id = %session.session_id, "dispatch to a torn-down session; evicting stale handle");
                    state.evict(&session);
                }
                let _ = downstream_tx.send(DownstreamEvent::new(
                    "error",
                    json!({ "message": "upstream not ready" }),
                ));
            }
        }
    }
}
