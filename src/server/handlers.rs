//! Admin API handlers.
//!
//! Thin translation layer: parse inputs, delegate to the registry, engine,
//! or settings registry, and map domain errors to HTTP status codes. No
//! business logic lives here.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::error;

use crate::error::PoolError;
use crate::models::settings::SettingsPatch;
use crate::pool::registry::NewProxy;
use crate::server::auth::{self, AuthUser};
use crate::server::AppState;

// ============================================================================
// Error mapping
// ============================================================================

pub struct ApiError(PoolError);

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PoolError::NotFound(_)
            | PoolError::NotHeld { .. }
            | PoolError::NoProxyAvailable(_) => StatusCode::NOT_FOUND,
            PoolError::Duplicate | PoolError::InstanceSaturated { .. } => StatusCode::CONFLICT,
            PoolError::FieldForbidden(_)
            | PoolError::InvalidField(_)
            | PoolError::SettingsEmpty => StatusCode::BAD_REQUEST,
            PoolError::Unauthorized => StatusCode::UNAUTHORIZED,
            PoolError::Store(e) => {
                error!("[Api] Store failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({
            "status": "error",
            "error": self.0.tag(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Health
// ============================================================================

pub async fn health() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

// ============================================================================
// Proxy CRUD
// ============================================================================

pub async fn add_proxy(
    State(state): State<AppState>,
    Json(descriptor): Json<NewProxy>,
) -> ApiResult<impl IntoResponse> {
    let id = state.registry.add(descriptor).await?;
    Ok(Json(serde_json::json!({
        "id": id,
        "status": "success",
        "message": "Proxy added, scheduled for checking",
    })))
}

#[derive(Deserialize)]
pub struct ListProxiesQuery {
    /// Comma-separated; proxies matching any tag are returned.
    pub tags: Option<String>,
}

pub async fn list_proxies(
    State(state): State<AppState>,
    Query(query): Query<ListProxiesQuery>,
) -> ApiResult<impl IntoResponse> {
    let tags = query.tags.map(|raw| {
        raw.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
    });
    let proxies = state.registry.list(tags)?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": format!("{} proxies", proxies.len()),
        "proxies": proxies,
    })))
}

pub async fn edit_proxy(
    State(state): State<AppState>,
    Path(proxy_id): Path<String>,
    Json(fields): Json<serde_json::Map<String, serde_json::Value>>,
) -> ApiResult<impl IntoResponse> {
    let (updated_fields, updated) = state.registry.edit(&proxy_id, &fields).await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Proxy updated and check scheduled",
        "updated_fields": updated_fields,
        "updated_proxy": updated,
    })))
}

pub async fn delete_proxy(
    State(state): State<AppState>,
    Path(proxy_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.registry.delete(&proxy_id)?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Proxy deleted",
    })))
}

// ============================================================================
// Assignment & leases
// ============================================================================

#[derive(Deserialize)]
pub struct AssignRequest {
    pub instance_id: String,
    pub country_code: Option<String>,
    pub tags: Option<Vec<String>>,
}

pub async fn assign_proxy(
    State(state): State<AppState>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<impl IntoResponse> {
    let assigned = state
        .engine
        .assign(
            &req.instance_id,
            req.country_code.as_deref(),
            req.tags.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": format!(
            "Proxy {} assigned to instance {}",
            assigned.proxy_id, req.instance_id
        ),
        "proxy_id": assigned.proxy_id,
        "ip": assigned.ip,
        "port": assigned.port,
        "username": assigned.username,
        "password": assigned.password,
        "protocol": assigned.protocol,
    })))
}

#[derive(Deserialize)]
pub struct RefreshUsageQuery {
    pub instance_id: Option<String>,
}

pub async fn refresh_proxy_usage(
    State(state): State<AppState>,
    Path(proxy_id): Path<String>,
    Query(query): Query<RefreshUsageQuery>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .refresh_usage(&proxy_id, query.instance_id.as_deref())
        .await?;
    let message = match query.instance_id {
        Some(instance) => format!("Proxy {} usage refreshed for instance {}", proxy_id, instance),
        None => format!("Proxy {} usage refreshed", proxy_id),
    };
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": message,
    })))
}

pub async fn clear_instance_proxies(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let cleared = state.engine.clear_lease(&instance_id).await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": format!(
            "Instance {} reservation cleared from proxies {}",
            instance_id,
            cleared.join(", ")
        ),
        "cleared_proxy_ids": cleared,
    })))
}

pub async fn clear_instance_from_specific_proxy(
    State(state): State<AppState>,
    Path((proxy_id, instance_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.engine.clear_lease_on(&proxy_id, &instance_id).await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": format!("Instance {} cleared from proxy {}", instance_id, proxy_id),
    })))
}

pub async fn reset_all_proxies(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let (total, reset) = state.registry.reset_all_leases()?;
    let body = if total == 0 {
        serde_json::json!({
            "status": "info",
            "message": "No proxies were available to reset.",
        })
    } else if reset == 0 {
        serde_json::json!({
            "status": "info",
            "message": "No proxies needed resetting.",
        })
    } else {
        serde_json::json!({
            "status": "success",
            "message": format!("Successfully reset {} proxies.", reset),
            "reset": reset,
        })
    };
    Ok(Json(body))
}

// ============================================================================
// Settings
// ============================================================================

pub async fn get_settings(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let settings = state.settings.snapshot();
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Current settings",
        "settings": &*settings,
    })))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<impl IntoResponse> {
    let settings = state.settings.update(&patch)?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Settings have been updated",
        "settings": &*settings,
    })))
}

// ============================================================================
// Password reset
// ============================================================================

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

pub async fn reset_password(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ResetPasswordRequest>,
) -> ApiResult<impl IntoResponse> {
    if auth::check_credentials(&state.store, &user.username, &req.old_password).is_err() {
        return Err(PoolError::InvalidField("old password is incorrect".to_string()).into());
    }
    state
        .store
        .set_user_password(&user.username, &auth::hash_password(&req.new_password))
        .map_err(PoolError::from)?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Password updated successfully",
    })))
}
