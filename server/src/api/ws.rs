//! Session Gateway
//!
//! Binds an upgraded WebSocket to a room member and its SFU peer, wires the
//! renegotiation and ICE callbacks, and runs the read/write pumps. All
//! errors are recovered here; nothing propagates across sessions.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::room::{LeaveOutcome, Member, Room};
use crate::signal::{IceCandidate, SignalKind, SignalMessage};

/// Query string of `GET /api/ws`.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    room_id: Option<String>,
    user_id: Option<String>,
    name: Option<String>,
}

/// WebSocket upgrade handler: resolves the room before upgrading.
pub async fn handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(room_id) = query.room_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Room ID required" })),
        )
            .into_response();
    };

    let Some(room) = state.manager.get_room(&room_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Room not found" })),
        )
            .into_response();
    };

    let user_id = query.user_id.unwrap_or_default();
    let name = query.name.unwrap_or_default();
    info!(room = %room_id, user = %user_id, name = %name, "WebSocket connection accepted");

    ws.on_upgrade(move |socket| handle_session(socket, state, room, user_id, name))
}

/// Run one member's signaling session from admission to teardown.
async fn handle_session(
    mut socket: WebSocket,
    state: AppState,
    room: Arc<Room>,
    user_id: String,
    name: String,
) {
    let (member, queue_rx) = Member::new(&user_id, &name);

    if let Err(e) = room.join(&member).await {
        warn!(room = %room.id(), user = %member.id(), error = %e, "Join rejected");
        let _ = socket.send(Message::Text("Room is full".into())).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let sfu = room.sfu().clone();

    // Renegotiation offers resolve the member by sfu-peer-id at emit time;
    // caching it here would keep dissolved members alive.
    {
        let manager = state.manager.clone();
        let room_id = room.id().to_string();
        sfu.set_renegotiation_callback(Box::new(move |sfu_peer_id, offer_sdp| {
            let manager = manager.clone();
            let room_id = room_id.clone();
            Box::pin(async move {
                let Some(room) = manager.get_room(&room_id).await else {
                    return;
                };
                let Some(member) = room.find_by_sfu_peer_id(&sfu_peer_id).await else {
                    debug!(peer = %sfu_peer_id, "Renegotiation target no longer in room");
                    return;
                };
                let message = SignalMessage::offer(offer_sdp);
                match serde_json::to_string(&message) {
                    Ok(frame) => {
                        if member.send(frame).await {
                            debug!(peer = %sfu_peer_id, "Renegotiation offer delivered");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode renegotiation offer"),
                }
            })
        }));
    }

    let peer = match sfu.add_peer(member.sfu_peer_id()).await {
        Ok(peer) => peer,
        Err(e) => {
            error!(room = %room.id(), user = %member.id(), error = %e, "Failed to create SFU peer");
            if room.leave(&member).await == LeaveOutcome::Dissolved {
                state.manager.delete_room(room.id()).await;
            }
            return;
        }
    };

    // Trickle locally gathered candidates out to the client.
    {
        let member = member.clone();
        peer.on_ice_candidate(move |init| {
            let member = member.clone();
            Box::pin(async move {
                let message = SignalMessage::candidate(IceCandidate::from(init));
                if let Ok(frame) = serde_json::to_string(&message) {
                    member.send(frame).await;
                }
            })
        });
    }

    if let Ok(frame) = serde_json::to_string(&SignalMessage::welcome(member.id())) {
        member.send(frame).await;
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let write_handle = tokio::spawn(write_pump(ws_tx, queue_rx));

    if let Ok(frame) = serde_json::to_string(&SignalMessage::join(member.id(), member.name())) {
        room.broadcast(&frame, member.id()).await;
    }
    let slot = member.slot().await;
    info!(room = %room.id(), user = %member.id(), slot, "Member joined");

    // Read pump: the driver of this session.
    while let Some(received) = ws_rx.next().await {
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                debug!(user = %member.id(), error = %e, "WebSocket read failed");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let mut signal: SignalMessage = match serde_json::from_str(&text) {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!(user = %member.id(), error = %e, "Dropping malformed signaling frame");
                        continue;
                    }
                };

                signal.from_user = member.id().to_string();
                signal.from_name = member.name().to_string();

                if signal.kind.is_media_signal() {
                    match sfu.handle_signal(member.sfu_peer_id(), &signal).await {
                        Ok(Some(response)) if signal.kind == SignalKind::Offer => {
                            if let Ok(frame) = serde_json::to_string(&response) {
                                member.send(frame).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(
                                peer = %member.sfu_peer_id(),
                                kind = ?signal.kind,
                                error = %e,
                                "Signal handling failed"
                            );
                        }
                    }
                } else {
                    match serde_json::to_string(&signal) {
                        Ok(frame) => room.broadcast(&frame, member.id()).await,
                        Err(e) => warn!(error = %e, "Failed to re-encode relay frame"),
                    }
                }
            }
            Message::Close(_) => {
                debug!(user = %member.id(), "WebSocket closed by client");
                break;
            }
            _ => {}
        }
    }

    // Teardown. Skipped when the room already dissolved underneath us (the
    // owner left): leave would be a no-op and the queue is already closed.
    if member.room_id().await.as_deref() == Some(room.id()) {
        if let Ok(frame) = serde_json::to_string(&SignalMessage::bye(member.id(), member.name())) {
            room.broadcast(&frame, member.id()).await;
        }

        sfu.remove_peer(member.sfu_peer_id()).await;

        if room.leave(&member).await == LeaveOutcome::Dissolved {
            state.manager.delete_room(room.id()).await;
        }
    }

    write_handle.abort();
    info!(room = %room.id(), user = %member.id(), "Session closed");
}

/// Single-writer pump: dequeues frames and writes one text frame each,
/// draining whatever is already buffered per wake to cut syscall overhead.
/// Exits when the queue closes (after a close frame) or the socket dies.
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut queue_rx: mpsc::Receiver<String>,
) {
    while let Some(frame) = queue_rx.recv().await {
        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
        while let Ok(frame) = queue_rx.try_recv() {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
}
