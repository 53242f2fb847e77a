//! HTTP request handlers.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::auth::Credentials;
use crate::server::ServerStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(flatten)]
    pub stats: ServerStats,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        stats: state.server.stats(),
    })
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub sso_token: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: String,
    pub workspace: String,
    pub workspace_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// POST /auth/login
///
/// Issues a session token for use with `InitConnection.Token`.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let credentials = match (request.password, request.sso_token) {
        (Some(secret), _) => Credentials::password(request.username, secret),
        (None, Some(token)) => Credentials::sso(request.username, token),
        (None, None) => return Err(ApiError::bad_request("password or sso_token is required")),
    };

    let outcome = state
        .server
        .login(&credentials, request.workspace.as_deref())
        .await?;

    Ok(Json(LoginResponse {
        token: outcome.session.id,
        user: outcome.user.username,
        workspace: outcome.workspace.name,
        workspace_id: outcome.workspace.id,
        expires_at: outcome.session.expires_at,
    }))
}
