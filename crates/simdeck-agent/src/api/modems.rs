//! Modem inventory endpoints.
//!
//! GET /api/modems                               - list modems
//! GET /api/modems/{id}                          - one modem
//! PUT /api/modems/{id}/sim-slots/{identifier}   - make a SIM slot primary
//! GET /api/modems/{id}/settings                 - per-modem settings
//! PUT /api/modems/{id}/settings                 - update per-modem settings

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Serialize;

use simdeck_common::models::{Device, NetworkStatus, Sim};

use crate::config::{ModemSettings, ModemSettingsUpdate};
use crate::state::AppState;

use super::{respond, ApiError, DataResponse};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_modems))
        .route("/{id}", get(get_modem))
        .route("/{id}/sim-slots/{identifier}", put(switch_sim_slot))
        .route("/{id}/settings", get(get_settings).put(update_settings))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemResponse {
    #[serde(flatten)]
    pub modem: Device,
    /// Alias when configured, otherwise the model name.
    pub name: String,
    #[serde(flatten)]
    pub network: NetworkStatus,
    /// SIM of every occupied slot, in slot order.
    pub slots: Vec<Sim>,
    /// Only probed for single-modem lookups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_esim: Option<bool>,
}

impl ModemResponse {
    /// Status reads that fail leave their fields empty; the modem is still
    /// listed.
    async fn build(state: &AppState, modem: Device) -> Self {
        let identity = modem.equipment_identifier.clone();
        let name = state
            .settings()
            .get(&identity)
            .alias
            .unwrap_or_else(|| modem.model.clone());
        let network = state
            .registry()
            .network(&modem)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(modem = %identity, error = %e, "failed to read network status");
                NetworkStatus::default()
            });
        let slots = state
            .registry()
            .sim_slots(&modem)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(modem = %identity, error = %e, "failed to read SIM slots");
                Vec::new()
            });
        Self {
            modem,
            name,
            network,
            slots,
            is_esim: None,
        }
    }
}

async fn list_modems(
    State(state): State<AppState>,
) -> Result<Json<DataResponse<Vec<ModemResponse>>>, ApiError> {
    let modems = state.service().modems().await?;
    let mut response = Vec::with_capacity(modems.len());
    for modem in modems {
        response.push(ModemResponse::build(&state, modem).await);
    }
    Ok(respond(response))
}

async fn get_modem(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<ModemResponse>>, ApiError> {
    let modem = state.service().modem(&id).await?;
    let is_esim = match state.service().supports_esim(&modem).await {
        Ok(supported) => supported,
        Err(e) => {
            tracing::warn!(modem = %id, error = %e, "eSIM probe failed");
            false
        }
    };
    let mut response = ModemResponse::build(&state, modem).await;
    response.is_esim = Some(is_esim);
    Ok(respond(response))
}

async fn switch_sim_slot(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.service().switch_sim_slot(&id, &identifier).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<DataResponse<ModemSettings>> {
    respond(state.settings().get(&id))
}

async fn update_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ModemSettingsUpdate>,
) -> Result<Json<DataResponse<ModemSettings>>, ApiError> {
    Ok(respond(state.settings().update(&id, body)?))
}
