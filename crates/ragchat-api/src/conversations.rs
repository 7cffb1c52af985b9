use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use ragchat_db::timestamp;
use ragchat_types::api::{
    AddParticipantRequest, ConversationResponse, CreateConversationRequest, Envelope, Page, PageQuery,
    ParticipantResponse,
};
use ragchat_types::models::normalize_email;

use crate::convert;
use crate::error::{ApiError, Payload, optional_json};
use crate::middleware::Principal;
use crate::state::AppState;

/// Create a conversation owned by the caller. The body is optional.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateConversationRequest = optional_json(&body)?;
    let title = req.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());

    let db = state.clone();
    let id = Uuid::new_v4().to_string();
    let owner = principal.id();
    let now = timestamp(Utc::now());
    let (row, participants) = tokio::task::spawn_blocking(move || {
        db.db.create_conversation(&id, &owner, title.as_deref(), &now)
    })
    .await??;

    info!(conversation_id = %row.id, owner = %row.owner_user_id, "Conversation created");
    Ok((
        StatusCode::CREATED,
        Json(Envelope::new(convert::conversation(row, Some(participants)))),
    ))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<ConversationResponse>>, ApiError> {
    let (page, limit) = query.resolve();
    let offset = (page - 1).saturating_mul(limit);

    let db = state.clone();
    let user_id = principal.id();
    let (rows, total) =
        tokio::task::spawn_blocking(move || db.db.list_conversations_for(&user_id, limit, offset)).await??;

    Ok(Json(Page {
        ok: true,
        page,
        limit,
        total,
        data: rows.into_iter().map(|r| convert::conversation_summary(r, None)).collect(),
    }))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Envelope<ConversationResponse>>, ApiError> {
    let db = state.clone();
    let user_id = principal.id();
    let found = tokio::task::spawn_blocking(move || {
        let Some(summary) = db.db.get_conversation_for(&conversation_id, &user_id)? else {
            return Ok::<_, anyhow::Error>(None);
        };
        let participants = db.db.list_participants(&conversation_id)?;
        Ok(Some((summary, participants)))
    })
    .await??;

    let (summary, participants) = found.ok_or(ApiError::ConversationNotFound)?;
    Ok(Json(Envelope::new(convert::conversation_summary(summary, Some(participants)))))
}

/// Soft-close. Only the owner can close, and only once.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Envelope<ConversationResponse>>, ApiError> {
    let db = state.clone();
    let owner = principal.id();
    let now = timestamp(Utc::now());
    let row = tokio::task::spawn_blocking(move || db.db.close_conversation(&conversation_id, &owner, &now))
        .await??
        .ok_or(ApiError::ConversationNotFound)?;

    info!(conversation_id = %row.id, "Conversation closed");
    Ok(Json(Envelope::new(convert::conversation(row, None))))
}

/// Owner-only. Adding someone who is already a participant is a no-op.
pub async fn add_participant(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(conversation_id): Path<String>,
    Payload(req): Payload<AddParticipantRequest>,
) -> Result<Json<Envelope<Vec<ParticipantResponse>>>, ApiError> {
    let email = req.email.as_deref().map(normalize_email).filter(|e| !e.is_empty());
    if req.user_id.is_none() && email.is_none() {
        return Err(ApiError::MissingFields);
    }

    let db = state.clone();
    let owner = principal.id();
    let participants = tokio::task::spawn_blocking(move || {
        if db.db.active_membership(&conversation_id, &owner)? != Some(true) {
            return Err(ApiError::ConversationNotFound);
        }

        let target = match (req.user_id, email) {
            (Some(user_id), _) => db.db.get_user_by_id(&user_id.to_string())?,
            (None, Some(email)) => db.db.get_user_by_email(&email)?,
            (None, None) => None,
        };
        let target = target.ok_or(ApiError::UserNotFound)?;

        let now = timestamp(Utc::now());
        if db.db.add_participant(&conversation_id, &target.id, &now)? {
            info!(%conversation_id, user_id = %target.id, "Participant added");
        }

        Ok(db.db.list_participants(&conversation_id)?)
    })
    .await??;

    Ok(Json(Envelope::new(participants.into_iter().map(convert::participant).collect())))
}
