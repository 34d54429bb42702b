//! WebSocket endpoint of the broadcast hub.
//!
//! The server speaks first with `auth_required`. Nothing else is sent until the
//! client authenticates with `{"type":"auth","access_token":...}`; a rejected
//! token gets `auth_invalid` and the socket is closed.

use crate::hub::ConnectionId;
use crate::{AppState, BroadcastHub};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use clawbridge_core::ClientIdentity;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Auth {
        #[serde(default)]
        access_token: Option<String>,
    },
    SubscribeEntities {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        entity_ids: Option<Vec<String>>,
    },
    Ping {
        #[serde(default)]
        id: Option<u64>,
    },
}

fn result(id: Option<u64>, success: bool) -> Value {
    json!({ "id": id, "type": "result", "success": success })
}

/// Upgrade handler for `/api/websocket`.
pub async fn websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let ip = connect
        .map(|ConnectInfo(addr)| addr.ip().to_canonical())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    ws.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket.send(Message::Text(value.to_string())).await.is_ok()
}

/// Wait for the `auth` message and resolve it to an identity.
async fn authenticate(socket: &mut WebSocket, state: &AppState, ip: IpAddr) -> Option<ClientIdentity> {
    let message = match tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => return None,
        Err(_) => {
            debug!(%ip, "Handshake timed out");
            return None;
        }
    };
    let token = match serde_json::from_str::<ClientMessage>(&message) {
        Ok(ClientMessage::Auth { access_token }) => access_token,
        _ => {
            debug!(%ip, "First message was not auth");
            return None;
        }
    };
    state.mediator.authenticate(token.as_deref(), ip).ok()
}

/// Apply one post-handshake message and build the reply.
fn handle_client_message(hub: &BroadcastHub, connection: ConnectionId, text: &str) -> Value {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::SubscribeEntities { id, entity_ids }) => {
            let entities = entity_ids.map(|ids| ids.into_iter().collect::<BTreeSet<_>>());
            debug!(connection, entities = ?entities.as_ref().map(BTreeSet::len), "Subscription changed");
            result(id, hub.subscribe(connection, entities))
        }
        Ok(ClientMessage::Ping { id }) => json!({ "id": id, "type": "pong" }),
        Ok(ClientMessage::Auth { .. }) => result(None, false),
        Err(_) => {
            let id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_u64));
            result(id, false)
        }
    }
}

#[instrument(skip(socket, state))]
async fn handle_socket(mut socket: WebSocket, state: AppState, ip: IpAddr) {
    if !send_json(&mut socket, json!({ "type": "auth_required" })).await {
        return;
    }
    let Some(identity) = authenticate(&mut socket, &state, ip).await else {
        warn!(%ip, "WebSocket authentication failed");
        let _ = send_json(&mut socket, json!({ "type": "auth_invalid", "message": "Invalid access token" })).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    if !send_json(&mut socket, json!({ "type": "auth_ok" })).await {
        return;
    }

    let label = identity.label();
    let (connection, mut changes) = state.hub.register(identity);
    info!(connection, identity = %label, "WebSocket client connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            change = changes.recv() => {
                let Some(change) = change else {
                    // The hub dropped this connection.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let event = json!({ "type": "event", "event": &*change });
                if sink.send(Message::Text(event.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_message(&state.hub, connection, &text);
                    if sink.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    state.hub.unregister(connection);
    info!(connection, identity = %label, "WebSocket client disconnected");
}
