//! Runtime maintenance mode control.
//!
//! Both routes sit under `/api/admin/`, which the default role policies deny
//! to plain users. Admins bypass maintenance mode, so they can turn the switch
//! off again while it is on.

use axum::extract::State;
use axum::{Extension, Json};
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::middleware::ValidatedJson;
use crate::models::{MaintenanceStatus, MaintenanceUpdate, Principal};
use crate::state::AppState;

fn current_status(state: &AppState) -> MaintenanceStatus {
    MaintenanceStatus {
        enabled: state.maintenance.is_enabled(),
        estimated_recovery_time: state.config.maintenance_eta.clone(),
    }
}

/// `GET /api/admin/maintenance`
#[instrument(skip(state))]
pub async fn get_maintenance(State(state): State<AppState>) -> Json<MaintenanceStatus> {
    Json(current_status(&state))
}

/// `PUT /api/admin/maintenance` with body `{"enabled": bool}`.
///
/// The body arrives already cleaned by JSON validation; a request without a
/// JSON content type is refused.
#[instrument(skip(state, payload, principal))]
pub async fn set_maintenance(
    State(state): State<AppState>,
    principal: Option<Extension<Principal>>,
    payload: Option<Extension<ValidatedJson>>,
) -> AppResult<Json<MaintenanceStatus>> {
    let Some(Extension(ValidatedJson(payload))) = payload else {
        return Err(AppError::BadRequest(
            "Expected a JSON body with an 'enabled' field".to_string(),
        ));
    };

    let update: MaintenanceUpdate = serde_json::from_value(payload)?;
    let previous = state.maintenance.set(update.enabled);

    info!(
        enabled = update.enabled,
        previous,
        by = principal
            .as_ref()
            .map(|Extension(p)| p.username.as_str())
            .unwrap_or("anonymous"),
        "Maintenance mode updated"
    );

    Ok(Json(current_status(&state)))
}
