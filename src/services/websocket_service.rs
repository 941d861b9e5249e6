use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::{
        validation::validate_user_id,
        ws::{ErrorNotice, IdentifiedAck, OutboundMessage, PlayerInboundMessage},
    },
    error::ServiceError,
    services::{room_events, room_service},
    state::{SharedState, connections::ChannelSender},
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle the full lifecycle of one player WebSocket channel.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing in order while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("websocket identification timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let user_id = match PlayerInboundMessage::from_json_str(&initial_message) {
        Ok(PlayerInboundMessage::Identification { user_id }) if validate_user_id(&user_id).is_ok() => {
            user_id
        }
        Ok(_) => {
            warn!("first message was not a valid identification");
            reject(&outbound_tx, "first message must identify the user");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to parse player message");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let channel = Uuid::new_v4();
    let profile = state.profile(&user_id).await;
    send_to_channel(
        &outbound_tx,
        &OutboundMessage::Identified(IdentifiedAck {
            user_id: user_id.clone(),
            display_name: profile.display_name.clone(),
        }),
    );
    let registration = state
        .connections()
        .register(channel, outbound_tx.clone(), profile.clone());
    if let Some(displaced) = registration.displaced {
        room_events::broadcast_offline(&state, displaced);
    }
    if registration.first_channel {
        room_events::broadcast_online(&state, profile);
    }
    info!(%channel, user_id = %user_id, "player connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match PlayerInboundMessage::from_json_str(&text) {
                Ok(PlayerInboundMessage::Vote { room_id, target_id }) => {
                    if let Err(err) =
                        room_service::cast_vote(&state, &user_id, &room_id, &target_id).await
                    {
                        debug!(%channel, user_id = %user_id, error = %err, "vote rejected");
                        send_error(&outbound_tx, &err);
                    }
                }
                Ok(PlayerInboundMessage::Identification { .. }) => {
                    warn!(%channel, user_id = %user_id, "ignoring duplicate identification message");
                }
                Ok(PlayerInboundMessage::Unknown) => {
                    debug!(%channel, user_id = %user_id, "ignoring unknown message type");
                }
                Err(err) => {
                    warn!(%channel, user_id = %user_id, error = %err, "failed to parse player message");
                    reject(&outbound_tx, "malformed message");
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(%channel, user_id = %user_id, "player closed channel");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(%channel, user_id = %user_id, error = %err, "websocket error");
                break;
            }
        }
    }

    if let Some(profile) = state.connections().unregister(channel) {
        room_events::broadcast_offline(&state, profile);
    }
    info!(%channel, user_id = %user_id, "player disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Serialize a message and push it onto one channel's writer queue.
fn send_to_channel(tx: &ChannelSender, message: &OutboundMessage) {
    match serde_json::to_string(message) {
        Ok(payload) => {
            let _ = tx.send(Message::Text(payload.into()));
        }
        Err(err) => warn!(kind = message.kind(), error = %err, "failed to serialize message"),
    }
}

fn reject(tx: &ChannelSender, message: &str) {
    send_to_channel(
        tx,
        &OutboundMessage::Error(ErrorNotice {
            message: message.to_string(),
        }),
    );
}

/// Report a failed request, hiding infrastructure details behind a retry hint.
fn send_error(tx: &ChannelSender, err: &ServiceError) {
    let message = if err.is_retryable() {
        "try again shortly".to_string()
    } else {
        err.to_string()
    };
    send_to_channel(tx, &OutboundMessage::Error(ErrorNotice { message }));
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
