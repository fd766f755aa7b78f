//! API Router and Application State
//!
//! The HTTP control surface: room creation, stats, the ICE server list and
//! the WebSocket upgrade that hands a client to the session gateway.

pub mod ws;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::room::RoomManager;

/// Room name used when the create request does not parse.
const DEFAULT_ROOM_NAME: &str = "默认房间";

/// Capacity used when the create request does not parse or asks for zero.
const DEFAULT_ROOM_CAPACITY: i64 = 10;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Registry of live rooms.
    pub manager: Arc<RoomManager>,
    /// Server configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        Self {
            manager: Arc::new(RoomManager::new(config.clone())),
            config,
        }
    }
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Open CORS: the signaling surface is same-machine or reverse-proxied.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/create", post(create_room))
        .route("/api/stats", get(get_stats))
        .route("/api/config", get(get_config))
        .route("/api/ws", get(ws::handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Body of `POST /api/create`.
#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    limits: i64,
}

/// Response of `POST /api/create`.
#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    /// Id of the new room.
    pub room_id: String,
    /// Owner id handed to the creator.
    pub master_id: String,
}

/// Response of `GET /api/stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Live room count.
    pub room_count: usize,
    /// Total members across rooms.
    pub user_count: usize,
    /// Equals `room_count` in this release.
    pub active_rooms: usize,
}

/// One ICE server entry.
#[derive(Debug, Serialize)]
pub struct IceServer {
    /// Server URLs.
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Response of `GET /api/config`.
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    /// ICE servers for the client's `RTCPeerConnection`.
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

/// Create a room. Malformed JSON falls back to the default name and
/// capacity instead of failing.
async fn create_room(State(state): State<AppState>, body: Bytes) -> Response {
    let request = serde_json::from_slice::<CreateRoomRequest>(&body).unwrap_or_else(|e| {
        debug!(error = %e, "Malformed create request, using defaults");
        CreateRoomRequest {
            name: DEFAULT_ROOM_NAME.to_string(),
            limits: DEFAULT_ROOM_CAPACITY,
        }
    });

    let capacity = if request.limits <= 0 {
        DEFAULT_ROOM_CAPACITY
    } else {
        request.limits
    } as usize;

    let master_id = Uuid::new_v4().to_string();
    match state
        .manager
        .create_room(&request.name, &master_id, capacity)
        .await
    {
        Ok(room) => {
            info!(room = %room.id(), master = %master_id, name = %request.name, "Room created");
            Json(CreateRoomResponse {
                room_id: room.id().to_string(),
                master_id,
            })
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to create room");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "failed to create room" })),
            )
                .into_response()
        }
    }
}

/// Room and member counts.
async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let room_count = state.manager.room_count().await;
    let user_count = state.manager.user_count().await;

    Json(StatsResponse {
        room_count,
        user_count,
        active_rooms: room_count,
    })
}

/// ICE server list for clients, sourced from configuration.
async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let mut servers = vec![IceServer {
        urls: vec![state.config.stun_server.clone()],
        username: None,
        credential: None,
    }];

    if let Some(turn) = &state.config.turn_server {
        servers.push(IceServer {
            urls: vec![turn.clone()],
            username: state.config.turn_username.clone(),
            credential: state.config.turn_credential.clone(),
        });
    }

    Json(ConfigResponse {
        ice_servers: servers,
    })
}
