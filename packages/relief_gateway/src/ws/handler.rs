//! WebSocket Handler
//!
//! Handshake admission and the per-session loop: outbound delivery,
//! keep-alive, and teardown.

use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures::{
    sink::{Sink, SinkExt},
    stream::StreamExt,
};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::app::AppState;
use crate::config::WebSocketConfig;
use crate::middleware::RequestContext;
use crate::registry::{DisconnectReason, SessionLink};

use super::protocol::{CLOSE_GOING_AWAY, ClientMessage, ServerMessage};

/// `GET /ws` - admit the handshake through the registry, then upgrade.
///
/// Admission failures (origin, draining) are answered before the upgrade, so
/// no session exists for a rejected client.
pub async fn websocket_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    ws: WebSocketUpgrade,
) -> Response {
    let link = match state.registry.register(ctx.origin.clone(), ctx.client_addr) {
        Ok(link) => link,
        Err(err) => return err.into_response(),
    };
    let config = state.config.websocket.clone();

    // If the upgrade fails the callback below is dropped together with the
    // link, which unregisters the session.
    ws.on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| run_session(socket, link, config))
}

/// Drive one admitted session until it closes, then unregister it.
pub async fn run_session(socket: WebSocket, mut link: SessionLink, config: WebSocketConfig) {
    let session_id = link.id();
    let shutdown = link.shutdown_token();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    if let Err(e) = send_message(&mut ws_sender, &ServerMessage::connected(session_id)).await {
        debug!(session_id = %session_id, "Failed to send connected ack: {}", e);
        link.close(DisconnectReason::SendFailed);
        return;
    }

    let idle_deadline = config.idle_deadline();
    let idle = tokio::time::sleep(idle_deadline);
    tokio::pin!(idle);

    let mut ping_interval =
        tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                // Flush what was queued before the close request, including
                // the closing notice.
                while let Some(msg) = link.try_next_outbound() {
                    if let Err(e) = send_message(&mut ws_sender, &msg).await {
                        debug!(session_id = %session_id, "Flush on shutdown stopped: {}", e);
                        break;
                    }
                }
                let _ = ws_sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "server shutting down".into(),
                    })))
                    .await;
                break DisconnectReason::ServerShutdown;
            }

            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break DisconnectReason::ClientClosed,
                    Some(Err(e)) => break DisconnectReason::TransportError(e.to_string()),
                    Some(Ok(msg)) => {
                        idle.as_mut().reset(Instant::now() + idle_deadline);
                        link.touch();
                        if let Message::Text(text) = msg {
                            let reply = match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(ClientMessage::Ping) => ServerMessage::pong(),
                                Err(e) => ServerMessage::Error {
                                    message: format!("Unrecognised message: {}", e),
                                },
                            };
                            if let Err(e) = send_message(&mut ws_sender, &reply).await {
                                debug!(session_id = %session_id, "Reply failed: {}", e);
                                break DisconnectReason::SendFailed;
                            }
                        }
                    }
                }
            }

            outbound = link.next_outbound() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = send_message(&mut ws_sender, &msg).await {
                            debug!(session_id = %session_id, "Delivery failed: {}", e);
                            break DisconnectReason::SendFailed;
                        }
                    }
                    // The registry already dropped this session.
                    None => break DisconnectReason::ServerShutdown,
                }
            }

            _ = ping_interval.tick() => {
                if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break DisconnectReason::SendFailed;
                }
            }

            _ = &mut idle => break DisconnectReason::PingTimeout,
        }
    };

    debug!(session_id = %session_id, reason = %reason, "Session loop ended");
    let _ = ws_sender.close().await;
    link.close(reason);
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("socket closed")]
    Closed,
}

async fn send_message<S>(sender: &mut S, msg: &ServerMessage) -> Result<(), SendError>
where
    S: Sink<Message> + Unpin,
{
    let json = serde_json::to_string(msg)?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| SendError::Closed)
}
