use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use tracing::info;

use ragchat_db::models::{ConversationFilter, FeedbackFilter, UserFilter};
use ragchat_types::api::{
    AdminConversationQuery, AdminFeedbackQuery, AdminUserQuery, AdminUserResponse, ConversationOverviewResponse,
    ConversationTranscriptResponse, Envelope, FeedbackDetailResponse, FeedbackStatsResponse, OkResponse, Page,
    SetActiveRequest,
};
use ragchat_types::models::{ROLE_ADMIN, ROLE_USER};

use crate::convert;
use crate::error::{ApiError, Payload};
use crate::middleware::Principal;
use crate::state::AppState;

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<AdminUserQuery>,
) -> Result<Json<Page<AdminUserResponse>>, ApiError> {
    let (page, limit) = query.paging.resolve();
    let filter = UserFilter {
        query: query.q.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()),
        role: query.role.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
        active: match query.status.as_deref() {
            Some("active") => Some(true),
            Some("inactive") => Some(false),
            _ => None,
        },
    };

    let db = state.clone();
    let offset = (page - 1).saturating_mul(limit);
    let (rows, total) = tokio::task::spawn_blocking(move || db.db.list_users(&filter, limit, offset)).await??;

    Ok(Json(Page {
        ok: true,
        page,
        limit,
        total,
        data: rows.into_iter().map(convert::admin_user).collect(),
    }))
}

pub async fn grant_admin(
    State(state): State<AppState>,
    Extension(admin): Extension<Principal>,
    Path(user_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let db = state.clone();
    let target = user_id.clone();
    tokio::task::spawn_blocking(move || {
        ensure_user(&db, &target)?;
        db.db.assign_role(&target, ROLE_ADMIN)?;
        Ok::<_, ApiError>(())
    })
    .await??;
    info!(by = %admin.user_id, %user_id, "Admin role granted");
    Ok(Json(OkResponse { ok: true }))
}

/// Drops the admin role and makes sure the plain user role remains.
pub async fn revoke_admin(
    State(state): State<AppState>,
    Extension(admin): Extension<Principal>,
    Path(user_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let db = state.clone();
    let target = user_id.clone();
    tokio::task::spawn_blocking(move || {
        ensure_user(&db, &target)?;
        db.db.revoke_role(&target, ROLE_ADMIN)?;
        db.db.assign_role(&target, ROLE_USER)?;
        Ok::<_, ApiError>(())
    })
    .await??;
    info!(by = %admin.user_id, %user_id, "Admin role revoked");
    Ok(Json(OkResponse { ok: true }))
}

pub async fn set_active(
    State(state): State<AppState>,
    Extension(admin): Extension<Principal>,
    Path(user_id): Path<String>,
    Payload(req): Payload<SetActiveRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let db = state.clone();
    let target = user_id.clone();
    let active = req.active;
    if !tokio::task::spawn_blocking(move || db.db.set_user_active(&target, active)).await?? {
        return Err(ApiError::UserNotFound);
    }
    info!(by = %admin.user_id, %user_id, active, "User activation changed");
    Ok(Json(OkResponse { ok: true }))
}

/// Blocking; call from inside `spawn_blocking`.
fn ensure_user(state: &AppState, user_id: &str) -> Result<(), ApiError> {
    state.db.get_user_by_id(user_id)?.map(|_| ()).ok_or(ApiError::UserNotFound)
}

// -- Chat analytics --

/// Every conversation, open or closed, newest first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<AdminConversationQuery>,
) -> Result<Json<Page<ConversationOverviewResponse>>, ApiError> {
    let (page, limit) = query.paging.resolve();
    let filter = ConversationFilter {
        query: non_blank(query.q),
        owner_user_id: non_blank(query.owner),
        participant_user_id: non_blank(query.participant),
    };

    let db = state.clone();
    let offset = (page - 1).saturating_mul(limit);
    let (rows, total) =
        tokio::task::spawn_blocking(move || db.db.list_conversation_overviews(&filter, limit, offset)).await??;

    Ok(Json(Page {
        ok: true,
        page,
        limit,
        total,
        data: rows.into_iter().map(convert::conversation_overview).collect(),
    }))
}

/// Full transcript with participants and each message's ratings.
pub async fn conversation_detail(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Envelope<ConversationTranscriptResponse>>, ApiError> {
    let db = state.clone();
    let transcript = tokio::task::spawn_blocking(move || db.db.conversation_transcript(&conversation_id))
        .await??
        .ok_or(ApiError::ConversationNotFound)?;

    let mut feedback: HashMap<String, Vec<FeedbackDetailResponse>> = HashMap::new();
    for row in transcript.feedback {
        feedback.entry(row.feedback.message_id.clone()).or_default().push(convert::feedback_detail(row));
    }

    let messages = transcript
        .messages
        .into_iter()
        .map(|row| {
            let fb = feedback.remove(&row.message.id).unwrap_or_default();
            convert::transcript_message(row, fb)
        })
        .collect();

    Ok(Json(Envelope::new(ConversationTranscriptResponse {
        conversation: convert::conversation_overview(transcript.overview),
        participants: transcript.participants.into_iter().map(convert::participant).collect(),
        messages,
    })))
}

/// Per-rater statistics, most active rater first.
pub async fn feedback_summary(
    State(state): State<AppState>,
) -> Result<Json<Envelope<Vec<FeedbackStatsResponse>>>, ApiError> {
    let db = state.clone();
    let rows = tokio::task::spawn_blocking(move || db.db.feedback_stats_by_user()).await??;
    Ok(Json(Envelope::new(rows.into_iter().map(convert::feedback_stats).collect())))
}

pub async fn list_feedback(
    State(state): State<AppState>,
    Query(query): Query<AdminFeedbackQuery>,
) -> Result<Json<Page<FeedbackDetailResponse>>, ApiError> {
    let (page, limit) = query.paging.resolve();
    let filter = FeedbackFilter {
        conversation_id: non_blank(query.conversation),
        user_id: non_blank(query.user),
    };

    let db = state.clone();
    let offset = (page - 1).saturating_mul(limit);
    let (rows, total) = tokio::task::spawn_blocking(move || db.db.list_feedback(&filter, limit, offset)).await??;

    Ok(Json(Page {
        ok: true,
        page,
        limit,
        total,
        data: rows.into_iter().map(convert::feedback_detail).collect(),
    }))
}

fn non_blank(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
