use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::models::{WsClientMessage, WsEvent};
use crate::service::chat_service::{ChatService, TurnEvent};

/// GET `/ws/chat`: upgrades to a WebSocket for streaming chat.
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(svc): State<ChatService>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, svc))
}

/// Handles a single WebSocket connection.
///
/// Protocol:
/// - Client sends `{ "type": "chat", "conversation_id": "...|null", "message": "..." }`
///   or `{ "type": "cancel" }`.
/// - Server streams back:
///   1. `{ "type": "stream_start", "conversation_id": "...", "message_id": "..." }`
///   2. `{ "type": "stream_chunk", "content": "..." }` (repeated)
///   3. `{ "type": "stream_end", "message_id": "...", "full_content": "..." }`
///   or `{ "type": "stream_aborted", ... }` when cancelled or the model failed,
///   or `{ "type": "error", "message": "..." }` when the request was rejected.
///
/// Closing the socket mid-turn cancels the turn.
async fn handle_socket(mut socket: WebSocket, svc: ChatService) {
    info!("WebSocket client connected");

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        let text = match &msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let request: WsClientMessage = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error {
                    message: format!("Invalid request: {e}"),
                })
                .await;
                continue;
            }
        };

        match request {
            WsClientMessage::Cancel => {
                svc.cancel_turn().await;
            }
            WsClientMessage::Chat { conversation_id, message } => {
                if !stream_turn(&mut socket, &svc, conversation_id, message).await {
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

/// Runs one turn and forwards its events. Returns `false` once the client is gone.
async fn stream_turn(
    socket: &mut WebSocket,
    svc: &ChatService,
    conversation_id: Option<String>,
    message: String,
) -> bool {
    if message.trim().is_empty() {
        return send_event(socket, &WsEvent::Error {
            message: "Field 'message' cannot be empty".to_string(),
        })
        .await;
    }
    let conversation_id = match conversation_id {
        Some(id) => id,
        None => svc.create_conversation().await.id,
    };

    // ── Drive the turn on its own task, forwarding events as they land ───────
    let (tx, mut rx) = mpsc::channel::<TurnEvent>(64);
    let turn_svc = svc.clone();
    let turn = tokio::spawn(async move {
        turn_svc.run_turn(&conversation_id, &message, Some(tx)).await
    });

    let mut connected = true;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    if let Some(ws_event) = to_ws_event(event) {
                        if connected && !send_event(socket, &ws_event).await {
                            connected = false;
                            svc.cancel_turn().await;
                        }
                    }
                }
                None => break,
            },
            incoming = socket.recv(), if connected => match incoming {
                Some(Ok(Message::Text(t))) => {
                    if let Ok(WsClientMessage::Cancel) = serde_json::from_str::<WsClientMessage>(&t) {
                        svc.cancel_turn().await;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    connected = false;
                    svc.cancel_turn().await;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    match turn.await {
        Ok(Ok(outcome)) => {
            debug!(conversation_id = %outcome.conversation.id, settled = outcome.is_settled(), "Turn finished");
        }
        Ok(Err(e)) => {
            warn!("Turn rejected: {e}");
            if connected {
                send_event(socket, &WsEvent::Error { message: e.to_string() }).await;
            }
        }
        Err(e) => {
            error!("Turn task panicked: {e}");
            if connected {
                send_event(socket, &WsEvent::Error {
                    message: "Internal error during streaming".to_string(),
                })
                .await;
            }
        }
    }
    connected
}

fn to_ws_event(event: TurnEvent) -> Option<WsEvent> {
    match event {
        TurnEvent::Submitted { .. } => None,
        TurnEvent::Started { conversation_id, message_id } => {
            Some(WsEvent::StreamStart { conversation_id, message_id })
        }
        TurnEvent::Fragment { text, .. } => Some(WsEvent::StreamChunk { content: text }),
        TurnEvent::Settled { message_id, content, .. } => Some(WsEvent::StreamEnd {
            message_id,
            full_content: content,
        }),
        TurnEvent::Aborted { message_id, reason, content, .. } => Some(WsEvent::StreamAborted {
            message_id,
            reason: reason.to_string(),
            partial_content: content,
        }),
    }
}

/// Helper: serialize a `WsEvent` and send it over the socket.
async fn send_event(socket: &mut WebSocket, event: &WsEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize WebSocket event: {e}");
            true
        }
    }
}
