//! Pending notification endpoints.
//!
//! GET    /api/modems/{id}/notifications                   - list
//! POST   /api/modems/{id}/notifications/{sequence}/resend - deliver again
//! DELETE /api/modems/{id}/notifications/{sequence}        - drop from the card

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use simdeck_common::models::{NotificationSummary, SequenceNumber};

use crate::state::AppState;

use super::{respond, ApiError, DataResponse};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/notifications", get(list_notifications))
        .route("/{id}/notifications/{sequence}/resend", post(resend_notification))
        .route("/{id}/notifications/{sequence}", delete(remove_notification))
}

fn parse_sequence(raw: &str) -> Result<SequenceNumber, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ApiError::bad_request("sequence number is required"));
    }
    raw.parse()
        .map_err(|e| ApiError::bad_request(format!("invalid sequence number {raw:?}: {e}")))
}

async fn list_notifications(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<Vec<NotificationSummary>>>, ApiError> {
    Ok(respond(state.service().list_notifications(&id).await?))
}

async fn resend_notification(
    State(state): State<AppState>,
    Path((id, sequence)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let sequence = parse_sequence(&sequence)?;
    state.service().resend_notification(&id, sequence).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_notification(
    State(state): State<AppState>,
    Path((id, sequence)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let sequence = parse_sequence(&sequence)?;
    state.service().remove_notification(&id, sequence).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_parsing() {
        assert_eq!(parse_sequence(" 42 ").unwrap(), 42);
        assert_eq!(parse_sequence("").unwrap_err().status(), StatusCode::BAD_REQUEST);
        assert_eq!(parse_sequence("-1").unwrap_err().status(), StatusCode::BAD_REQUEST);
    }
}
