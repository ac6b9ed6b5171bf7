//! Live channel over WebSocket.
//!
//! One task per connection selects between inbound frames and the
//! connection's outbound queue, so a connection's inbound events are
//! handled strictly in arrival order. The connection lives no longer than
//! the credential it was opened with.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    Extension,
};
use tracing::{debug, info};

use duet_proto::{ClientEvent, ErrorBody, ServerEvent};

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::hub::{Channel, ConnectionId};

/// Upgrade an authenticated request to a live connection.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user: AuthUser) {
    let (connection, mut outbox) = state.hub.register(user.id());
    let mut shutdown = state.shutdown.clone();
    let expiry = tokio::time::sleep(user.remaining());
    tokio::pin!(expiry);
    info!(
        user = %user.id(),
        connection,
        open = state.hub.connections_of(user.id()),
        "live connection opened"
    );

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if user.is_expired() {
                        close_expired(&mut socket, connection).await;
                        break;
                    }
                    if let Some(reply) = handle_frame(&state, connection, &user, &text).await {
                        if send_event(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outbound = outbox.recv() => match outbound {
                Some(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut expiry => {
                close_expired(&mut socket, connection).await;
                break;
            }
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.hub.remove(connection);
    info!(user = %user.id(), connection, "live connection closed");
}

/// Apply one client frame. Returns the direct reply, if any.
async fn handle_frame(
    state: &AppState,
    connection: ConnectionId,
    user: &AuthUser,
    text: &str,
) -> Option<ServerEvent> {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(connection, error = %e, "malformed frame");
            return Some(ServerEvent::Error(ErrorBody::new(
                "invalid_operation",
                "malformed frame",
            )));
        }
    };

    match event {
        ClientEvent::JoinConversation(target) => {
            match state.relay.ensure_member(user.id(), target.conversation_id).await {
                Ok(_) => {
                    state
                        .hub
                        .subscribe(connection, Channel::Conversation(target.conversation_id));
                    Some(ServerEvent::Joined(target))
                }
                Err(e) => Some(ServerEvent::Error(e.to_error_body())),
            }
        }
        ClientEvent::LeaveConversation(target) => {
            state
                .hub
                .unsubscribe(connection, Channel::Conversation(target.conversation_id));
            None
        }
        ClientEvent::SendMessage(message) => {
            // the sender's own copy arrives through the broadcast if joined
            match state
                .relay
                .append_message(
                    message.conversation_id,
                    user.id(),
                    message.nonce,
                    message.ciphertext,
                )
                .await
            {
                Ok(_) => None,
                Err(e) => Some(ServerEvent::Error(e.to_error_body())),
            }
        }
    }
}

/// Tell the client its credential ran out, then close.
async fn close_expired(socket: &mut WebSocket, connection: ConnectionId) {
    debug!(connection, "credential expired, closing live connection");
    let event = ServerEvent::Error(ErrorBody::new("unauthorized", "Unauthorized"));
    let _ = send_event(socket, &event).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json)).await,
        Err(e) => {
            debug!(error = %e, "event serialization failed");
            Ok(())
        }
    }
}
