use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use fieldhub_shared::errors::AppResult;
use fieldhub_shared::types::api::ApiResponse;
use fieldhub_shared::types::auth::AuthUser;

use crate::models::ThreadId;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ActiveThreadRequest {
    pub thread_id: Option<ThreadId>,
}

#[derive(Debug, Serialize)]
pub struct ActiveThreadResponse {
    pub thread_id: Option<ThreadId>,
    pub changed: bool,
}

/// PUT /session/active-thread
/// `null` means no thread is open.
pub async fn set_active_thread(
    State(state): State<Arc<AppState>>,
    auth_user: AuthUser,
    Json(body): Json<ActiveThreadRequest>,
) -> AppResult<Json<ApiResponse<ActiveThreadResponse>>> {
    let changed = state.sessions.set_active_thread(auth_user.id, body.thread_id);
    tracing::debug!(viewer_id = %auth_user.id, thread_id = ?body.thread_id, changed, "active thread set");

    Ok(Json(ApiResponse::ok(ActiveThreadResponse {
        thread_id: body.thread_id,
        changed,
    })))
}

#[derive(Debug, Serialize)]
pub struct CloseSessionResponse {
    pub closed: usize,
}

/// DELETE /session
/// Release every subscription and cache of the viewer.
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    auth_user: AuthUser,
) -> AppResult<Json<ApiResponse<CloseSessionResponse>>> {
    let closed = state.sessions.close(auth_user.id).await;
    Ok(Json(ApiResponse::ok(CloseSessionResponse { closed })))
}
