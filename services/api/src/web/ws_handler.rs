//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a WebSocket connection.
//!
//! Every connection registers with the connection hub and owns a single writer
//! task that merges hub status events with replies to its own requests. Each
//! chat or analysis request runs on its own task, so a disconnect never aborts
//! persistence of a turn that is already under way.

use crate::chat::{ConnectionId, Origin, SendMessageRequest};
use crate::web::{
    protocol::{parse_analysis_type, ClientMessage, ServerMessage},
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use research_assistant_core::domain::AuthenticatedUser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Replies waiting for the writer task of one connection.
const REPLY_BUFFER: usize = 32;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, user: AuthenticatedUser) {
    let (connection_id, mut events) = app_state.hub().register(user.user_id);
    info!(
        "New WebSocket connection {} established for user: {} ({} open)",
        connection_id,
        user.user_id,
        app_state.hub().connection_count(user.user_id)
    );

    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(REPLY_BUFFER);
    let shutdown = CancellationToken::new();

    // --- 1. Writer Task ---
    let writer = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if send_frame(&mut sender, &ServerMessage::Connected { connection_id })
                .await
                .is_err()
            {
                return;
            }
            loop {
                // Status events go first so `processing_stopped` precedes the reply it brackets.
                let frame = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    Some(event) = events.recv() => ServerMessage::from(event),
                    Some(frame) = reply_rx.recv() => frame,
                    else => break,
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    debug!("Failed to write frame, closing writer for {}", connection_id);
                    break;
                }
            }
            let _ = sender.close().await;
        })
    };

    // --- 2. Main Message Loop ---
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_text_message(text.as_str(), &app_state, user, connection_id, &reply_tx);
            }
            Ok(Message::Close(_)) => {
                info!("Client sent close message.");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    // --- 3. Cleanup ---
    // In-flight turns keep running and persist their results.
    app_state.hub().unregister(user.user_id, connection_id);
    shutdown.cancel();
    if let Err(e) = writer.await {
        error!("Writer task for {} failed: {:?}", connection_id, e);
    }
    info!("WebSocket connection {} closed.", connection_id);
}

/// Helper function to handle the logic for different `ClientMessage` variants.
fn handle_text_message(
    text: &str,
    app_state: &Arc<AppState>,
    user: AuthenticatedUser,
    connection_id: ConnectionId,
    replies: &mpsc::Sender<ServerMessage>,
) {
    let origin = Origin::Connection(connection_id);
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::ChatMessage {
            message,
            conversation_id,
            context,
        }) => {
            let app_state = app_state.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                let frame = match context.unwrap_or_default().into_hints() {
                    Ok(hints) => {
                        let request = SendMessageRequest {
                            text: message,
                            conversation_id,
                            hints,
                        };
                        match app_state.dispatcher.send_message(&user, request, origin).await {
                            Ok(reply) => ServerMessage::from(reply),
                            Err(e) => ServerMessage::from(e),
                        }
                    }
                    Err(e) => ServerMessage::from(e),
                };
                deliver(&replies, frame).await;
            });
        }
        Ok(ClientMessage::AnalyzeDocument {
            document_id,
            analysis_type,
        }) => {
            let app_state = app_state.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                let frame = match parse_analysis_type(analysis_type.as_deref()) {
                    Ok(analysis_type) => match app_state
                        .dispatcher
                        .analyze_document(&user, document_id, analysis_type, origin)
                        .await
                    {
                        Ok(reply) => ServerMessage::from(reply),
                        Err(e) => ServerMessage::from(e),
                    },
                    Err(e) => ServerMessage::from(e),
                };
                deliver(&replies, frame).await;
            });
        }
        Ok(ClientMessage::AnalyzeText {
            text,
            analysis_type,
        }) => {
            let app_state = app_state.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                let frame = match parse_analysis_type(analysis_type.as_deref()) {
                    Ok(analysis_type) => match app_state
                        .dispatcher
                        .analyze_text(&user, &text, analysis_type, origin)
                        .await
                    {
                        Ok(reply) => ServerMessage::from(reply),
                        Err(e) => ServerMessage::from(e),
                    },
                    Err(e) => ServerMessage::from(e),
                };
                deliver(&replies, frame).await;
            });
        }
        Ok(ClientMessage::TypingStart { conversation_id }) => {
            app_state
                .dispatcher
                .relay_typing(user.user_id, connection_id, conversation_id, true);
        }
        Ok(ClientMessage::TypingStop { conversation_id }) => {
            app_state
                .dispatcher
                .relay_typing(user.user_id, connection_id, conversation_id, false);
        }
        Ok(ClientMessage::Ping) => {
            if replies.try_send(ServerMessage::Pong).is_err() {
                debug!("Dropped pong for busy connection {}", connection_id);
            }
        }
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            let frame = ServerMessage::Error {
                message: "Invalid message format".to_string(),
            };
            if replies.try_send(frame).is_err() {
                debug!("Dropped error frame for busy connection {}", connection_id);
            }
        }
    }
}

/// Hands a reply to the writer task. The connection may already be gone.
async fn deliver(replies: &mpsc::Sender<ServerMessage>, frame: ServerMessage) {
    if replies.send(frame).await.is_err() {
        debug!("Connection closed before the reply could be delivered.");
    }
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize server message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}
