use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use fleet_infra::BatchReport;
use fleet_infra::discovery::HealthReport;
use fleet_infra::driver::DeploymentEntry;
use fleet_infra::types::{DeployedMachine, ProvisioningResult};

use crate::dto::{DeployRequest, MachineList};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn deploy_machines(
    State(state): State<AppState>,
    Json(req): Json<DeployRequest>,
) -> Result<Json<BatchReport>, ApiError> {
    if req.machines.is_empty() {
        return Err(ApiError::BadRequest("no machines requested".into()));
    }
    Ok(Json(state.deployer.deploy_machines(req.machines).await))
}

pub async fn list_machines(State(state): State<AppState>) -> Result<Json<MachineList>, ApiError> {
    Ok(Json(state.deployer.list().await?.into()))
}

pub async fn get_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeployedMachine>, ApiError> {
    state
        .deployer
        .get(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// 200 when the guests are gone, 502 with the tool's evidence otherwise.
pub async fn destroy_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ProvisioningResult>), ApiError> {
    let result = state.deployer.destroy(&id).await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(result)))
}

pub async fn machine_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HealthReport>, ApiError> {
    Ok(Json(state.deployer.health_check(&id).await?))
}

pub async fn list_deployments(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeploymentEntry>>, ApiError> {
    Ok(Json(state.deployer.list_deployments().await?))
}
