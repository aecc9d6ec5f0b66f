//! eSIM profile endpoints.
//!
//! GET    /api/modems/{id}/esims                   - list profiles
//! POST   /api/modems/{id}/esims/{iccid}/enabling  - enable a profile
//! DELETE /api/modems/{id}/esims/{iccid}           - delete a profile
//! PUT    /api/modems/{id}/esims/{iccid}/nickname  - set a nickname
//! GET    /api/modems/{id}/esims/discovery         - pending downloads on SM-DS
//! GET    /api/modems/{id}/esims/download          - download (WebSocket)

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};

use simdeck_common::models::{DiscoveredProfile, Iccid, ProfileSummary, SequenceNumber};
use simdeck_common::protocol::{DownloadClientMessage, DownloadServerMessage};

use crate::download::{self, ClientMessages, MessageSink};
use crate::error::{Error, Result};
use crate::state::AppState;

use super::{respond, ApiError, DataResponse};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/esims", get(list_profiles))
        .route("/{id}/esims/discovery", get(discover_profiles))
        .route("/{id}/esims/download", get(download_profile))
        .route("/{id}/esims/{iccid}", delete(delete_profile))
        .route("/{id}/esims/{iccid}/enabling", post(enable_profile))
        .route("/{id}/esims/{iccid}/nickname", put(set_nickname))
}

fn parse_iccid(raw: &str) -> Result<Iccid, ApiError> {
    raw.trim()
        .parse()
        .map_err(|e: simdeck_common::models::InvalidIccid| ApiError::bad_request(e.to_string()))
}

async fn list_profiles(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<Vec<ProfileSummary>>>, ApiError> {
    Ok(respond(state.service().list_profiles(&id).await?))
}

async fn enable_profile(
    State(state): State<AppState>,
    Path((id, iccid)): Path<(String, String)>,
) -> Result<Json<DataResponse<serde_json::Value>>, ApiError> {
    let iccid = parse_iccid(&iccid)?;
    state.service().enable_profile(&id, &iccid).await?;
    Ok(respond(serde_json::json!({})))
}

async fn discover_profiles(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<Vec<DiscoveredProfile>>>, ApiError> {
    Ok(respond(state.service().discover(&id).await?))
}

// ── Delete ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    /// Delete notifications that were sent (or attempted).
    pub notifications: Vec<SequenceNumber>,
    /// Delivery failures; the profile is deleted regardless.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

async fn delete_profile(
    State(state): State<AppState>,
    Path((id, iccid)): Path<(String, String)>,
) -> Result<Json<DataResponse<DeleteResponse>>, ApiError> {
    let iccid = parse_iccid(&iccid)?;
    let response = match state.service().delete_profile(&id, &iccid).await {
        Ok(notifications) => DeleteResponse {
            notifications,
            failures: Vec::new(),
        },
        Err(e) => match e.root() {
            Error::PartialNotificationFailure {
                sequences,
                failures,
            } => {
                tracing::warn!(modem = %id, %iccid, error = %e, "profile deleted, notification delivery failed");
                DeleteResponse {
                    notifications: sequences.clone(),
                    failures: failures.clone(),
                }
            }
            _ => return Err(e.into()),
        },
    };
    Ok(respond(response))
}

// ── Nickname ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NicknameRequest {
    #[serde(default)]
    pub nickname: String,
}

async fn set_nickname(
    State(state): State<AppState>,
    Path((id, iccid)): Path<(String, String)>,
    Json(body): Json<NicknameRequest>,
) -> Result<Json<DataResponse<serde_json::Value>>, ApiError> {
    let iccid = parse_iccid(&iccid)?;
    state
        .service()
        .set_nickname(&id, &iccid, &body.nickname)
        .await?;
    Ok(respond(serde_json::json!({})))
}

// ── Download ────────────────────────────────────────────────────────

/// Resolve the modem before upgrading so an unknown id is a plain 404.
async fn download_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let device = state.service().modem(&id).await?;
    Ok(ws.on_upgrade(move |socket| async move {
        let (ws_tx, ws_rx) = socket.split();
        download::serve(
            state.service(),
            &device,
            Box::new(SocketSink(ws_tx)),
            client_messages(ws_rx),
        )
        .await;
    }))
}

struct SocketSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl MessageSink for SocketSink {
    async fn send(&mut self, message: &DownloadServerMessage) -> Result<()> {
        let json = serde_json::to_string(message).map_err(|e| Error::Protocol(e.to_string()))?;
        self.0
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| Error::Disconnected)
    }
}

/// Decode text frames. The stream ends at a close frame; anything that is
/// not a JSON text frame is an error, which the bridge treats as a
/// disconnect.
fn client_messages(ws_rx: SplitStream<WebSocket>) -> ClientMessages {
    ws_rx
        .take_while(|frame| futures::future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(
                    serde_json::from_str::<DownloadClientMessage>(text.as_str())
                        .map_err(|e| Error::Protocol(format!("invalid message: {e}"))),
                ),
                Ok(Message::Binary(_)) => {
                    Some(Err(Error::Protocol("binary frames are not supported".into())))
                }
                Ok(_) => None,
                Err(e) => Some(Err(Error::Protocol(format!("read: {e}")))),
            }
        })
        .boxed()
}
