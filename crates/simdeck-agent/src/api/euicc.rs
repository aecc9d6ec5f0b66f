//! GET /api/modems/{id}/euicc: eUICC identity and capacity.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use simdeck_common::models::EuiccSummary;

use crate::state::AppState;

use super::{respond, ApiError, DataResponse};

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/euicc", get(get_euicc))
}

async fn get_euicc(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<EuiccSummary>>, ApiError> {
    Ok(respond(state.service().euicc_info(&id).await?))
}
