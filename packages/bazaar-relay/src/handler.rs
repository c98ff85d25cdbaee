//! WebSocket connection handler.
//!
//! The transport side of presence: a socket becomes a registry entry once
//! it registers, and stops being one when it closes. Everything pushed to
//! the participant flows through the connection's outbound queue.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::messaging::SendMessageRequest;
use crate::presence::{ConnectionHandle, WeakConnectionHandle};
use crate::protocol::{ClientMessage, ParticipantKey, Role, ServerMessage};
use crate::state::RelayState;

/// Write a message straight to the socket, before the writer task exists.
/// Returns false if the connection is gone.
async fn send_direct(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            true
        }
    }
}

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Waits for a `Register` message naming the participant
/// 2. Puts the connection in the presence registry
/// 3. Spawns a writer task draining the outbound queue
/// 4. Processes incoming messages until the connection closes
/// 5. Removes this connection (and only this one) from the registry
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Wait for Registration ─────────────────────────────────────

    let key = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Register { role, id }) => {
                    if id <= 0 {
                        let err = ServerMessage::Error {
                            message: "Participant id must be positive".to_string(),
                        };
                        if !send_direct(&mut ws_sender, &err).await {
                            return;
                        }
                        continue;
                    }
                    break ParticipantKey::new(role, id);
                }
                Ok(ClientMessage::Ping) => {
                    if !send_direct(&mut ws_sender, &ServerMessage::Pong).await {
                        return;
                    }
                }
                Ok(_) => {
                    let err = ServerMessage::Error {
                        message: "Must register before sending other messages".to_string(),
                    };
                    if !send_direct(&mut ws_sender, &err).await {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse client message: {}", e);
                    let err = ServerMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    };
                    if !send_direct(&mut ws_sender, &err).await {
                        return;
                    }
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                return; // Connection closed before registration
            }
            _ => continue,
        }
    };

    // ── Step 2: Register Participant ──────────────────────────────────────

    // The registry entry is the only owner of the queue. This task keeps a
    // weak view, so replacing or draining the entry closes the connection.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let handle = ConnectionHandle::new(tx);
    let own = handle.downgrade();
    let connection_id = own.connection_id();
    handle.push(ServerMessage::Registered {
        role: key.role,
        id: key.id,
    });
    state.presence.connect(key, handle);

    // ── Step 3: Spawn Writer Task ─────────────────────────────────────────

    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        return; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
        // Queue closed by the registry
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // ── Step 4: Process Messages ──────────────────────────────────────────

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                let Some(msg_result) = incoming else {
                    break;
                };
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => {
                                handle_client_message(&state, key, &own, client_msg);
                            }
                            Err(e) => {
                                tracing::warn!(
                                    participant = %key,
                                    error = %e,
                                    "Failed to parse client message"
                                );
                                own.push(ServerMessage::Error {
                                    message: format!("Invalid message format: {}", e),
                                });
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(participant = %key, "Client sent close frame");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            participant = %key,
                            error = %e,
                            "WebSocket error"
                        );
                        break;
                    }
                    _ => {} // Binary, Ping, Pong
                }
            }
            _ = &mut writer_task => {
                tracing::info!(participant = %key, "Outbound queue closed");
                break;
            }
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    state.presence.disconnect_connection(key, connection_id);
    writer_task.abort();
    tracing::info!(participant = %key, "WebSocket disconnected");
}

/// Handle a parsed client message from a registered connection.
///
/// Replies go to `own`, the connection that sent the request, never to
/// whichever connection the registry holds for `key` at that moment.
pub fn handle_client_message(
    state: &RelayState,
    key: ParticipantKey,
    own: &WeakConnectionHandle,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Register { .. } => {
            own.push(ServerMessage::Error {
                message: "Already registered".to_string(),
            });
        }

        ClientMessage::Send {
            user_id,
            shop_id,
            content,
            conversation_id,
        } => {
            let request = SendMessageRequest {
                user_id,
                shop_id,
                content,
                conversation_id,
            };
            handle_send(state, key, own, request);
        }

        ClientMessage::MarkSeen { conversation_id } => {
            let reply = match state.seen.mark_seen_by(conversation_id, key) {
                Ok(()) => ServerMessage::SeenUpdated { conversation_id },
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            };
            own.push(reply);
        }

        ClientMessage::Ping => {
            own.push(ServerMessage::Pong);
        }
    }
}

// ── Message Handlers ──────────────────────────────────────────────────────────

/// Send a chat message authored by the registered participant.
fn handle_send(
    state: &RelayState,
    key: ParticipantKey,
    own: &WeakConnectionHandle,
    request: SendMessageRequest,
) {
    let author_id = match key.role {
        Role::User => request.user_id,
        Role::Shop => request.shop_id,
    };
    if author_id != key.id {
        tracing::warn!(
            participant = %key,
            author_id = author_id,
            "Rejected send on behalf of another participant"
        );
        own.push(ServerMessage::Error {
            message: format!(
                "Registered as {} but message names {} {}",
                key, key.role, author_id
            ),
        });
        return;
    }

    let reply = match state.messages.send_message(key.role, request) {
        Ok(sent) => ServerMessage::Ack {
            message_id: sent.message.id,
            outcome: sent.outcome,
        },
        Err(e) => ServerMessage::Error {
            message: e.to_string(),
        },
    };
    own.push(reply);
}
