//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::experiment::ParticipantId;
use crate::lobby::LobbyService;
use crate::util::rate_limit::ParticipantRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::hub::Transport;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Participant identifier issued with the access code
    pub participant: ParticipantId,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Authorization happens in the lobby so refused participants still get a redirect
    info!(participant = %query.participant, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, query.participant, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, participant: ParticipantId, state: AppState) {
    let (ws_sink, ws_stream) = socket.split();

    let (token, outbound_rx) = state.hub.register(participant.clone());

    // Spawn writer task: hub -> WebSocket
    let writer_participant = participant.clone();
    let writer_handle = tokio::spawn(async move {
        write_loop(writer_participant, ws_sink, outbound_rx).await;
    });

    let admitted = admit(&state.lobby, state.hub.as_ref(), &participant).await;

    if admitted {
        read_loop(&participant, ws_stream, &state).await;
    } else {
        // Redirect is queued; keep the socket open until the client leaves
        drain(&participant, ws_stream).await;
    }

    // A replaced connection must not disconnect the newer one
    if state.hub.unregister(&participant, token) && admitted {
        state.lobby.disconnect(&participant).await;
    }

    writer_handle.abort();
    info!(participant = %participant, "WebSocket connection closed");
}

/// Place the participant in the lobby; only placed participants are welcomed
async fn admit(lobby: &LobbyService, hub: &dyn Transport, participant: &ParticipantId) -> bool {
    match lobby.connect(participant.clone()).await {
        Ok(placement) => {
            info!(participant = %participant, ?placement, "Participant placed");
            hub.send_to(
                participant,
                ServerMsg::Welcome {
                    participant: participant.clone(),
                    server_time: unix_millis(),
                },
            );
            true
        }
        Err(e) => {
            warn!(participant = %participant, error = %e, "Participant refused");
            false
        }
    }
}

/// Reader loop: WebSocket -> lobby
async fn read_loop(
    participant: &ParticipantId,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    state: &AppState,
) {
    let rate_limiter = ParticipantRateLimiter::new();

    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_message() {
                    warn!(participant = %participant, "Rate limited client message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => state.lobby.route(participant, msg).await,
                    Err(e) => {
                        warn!(participant = %participant, error = %e, "Failed to parse client message");
                        state.hub.send_to(
                            participant,
                            ServerMsg::Error {
                                code: "bad_message".to_string(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(participant = %participant, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(participant = %participant, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(participant = %participant, error = %e, "WebSocket error");
                break;
            }
        }
    }
}

async fn drain(participant: &ParticipantId, mut ws_stream: futures::stream::SplitStream<WebSocket>) {
    while let Some(result) = ws_stream.next().await {
        if matches!(result, Ok(Message::Close(_)) | Err(_)) {
            break;
        }
        debug!(participant = %participant, "Ignoring message from refused participant");
    }
}

async fn write_loop(
    participant: ParticipantId,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<ServerMsg>,
) {
    while let Some(msg) = outbound_rx.recv().await {
        if let Err(e) = send_msg(&mut ws_sink, &msg).await {
            debug!(participant = %participant, error = %e, "WebSocket send failed");
            break;
        }
    }
    debug!(participant = %participant, "Outbound channel closed");
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
