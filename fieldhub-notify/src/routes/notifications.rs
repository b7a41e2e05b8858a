use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fieldhub_shared::errors::{AppError, AppResult, ErrorCode};
use fieldhub_shared::types::api::ApiResponse;
use fieldhub_shared::types::auth::AuthUser;

use crate::models::NotificationRecord;
use crate::services::purpose::Purpose;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PurposeQuery {
    pub purpose: Option<String>,
}

impl PurposeQuery {
    /// Requested purpose; `header` when absent.
    pub fn purpose(&self) -> AppResult<Purpose> {
        let Some(raw) = self.purpose.as_deref() else {
            return Ok(Purpose::default());
        };
        raw.parse::<Purpose>().map_err(|message| {
            let allowed: Vec<&str> = Purpose::all().iter().map(Purpose::as_str).collect();
            AppError::with_details(
                ErrorCode::BadRequest,
                message,
                serde_json::json!({ "purpose": raw, "allowed": allowed }),
            )
        })
    }
}

/// GET /notifications
/// Cached notifications of the viewer for one purpose, newest first.
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    auth_user: AuthUser,
    Query(query): Query<PurposeQuery>,
) -> AppResult<Json<ApiResponse<Vec<NotificationRecord>>>> {
    let inbox = state.sessions.inbox(auth_user.id, query.purpose()?).await;
    Ok(Json(ApiResponse::ok(inbox.notifications())))
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub count: usize,
}

/// GET /notifications/unread-count
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    auth_user: AuthUser,
    Query(query): Query<PurposeQuery>,
) -> AppResult<Json<ApiResponse<UnreadCountResponse>>> {
    let inbox = state.sessions.inbox(auth_user.id, query.purpose()?).await;
    Ok(Json(ApiResponse::ok(UnreadCountResponse {
        count: inbox.badge_count(),
    })))
}

#[derive(Debug, Serialize)]
pub struct MarkAllReadResponse {
    pub updated: usize,
}

/// POST /notifications/mark-all-read
pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    auth_user: AuthUser,
    Query(query): Query<PurposeQuery>,
) -> AppResult<Json<ApiResponse<MarkAllReadResponse>>> {
    let inbox = state.sessions.inbox(auth_user.id, query.purpose()?).await;
    Ok(Json(ApiResponse::ok(MarkAllReadResponse {
        updated: inbox.mark_all_read(),
    })))
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub id: Uuid,
    pub updated: bool,
}

/// POST /notifications/:id/read
/// Unknown ids are not an error: `updated` is simply false.
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
    Query(query): Query<PurposeQuery>,
) -> AppResult<Json<ApiResponse<MarkReadResponse>>> {
    let inbox = state.sessions.inbox(auth_user.id, query.purpose()?).await;
    let updated = inbox.mark_read(id);
    Ok(Json(ApiResponse::ok(MarkReadResponse { id, updated })))
}
