use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use ragchat_db::models::{MessageRow, NewMessage};
use ragchat_db::timestamp;
use ragchat_types::api::{AskRequest, AskResponse, Envelope, FeedbackResponse, MessageResponse, PostMessageRequest};
use ragchat_types::models::SenderKind;

use crate::convert;
use crate::error::{ApiError, Payload};
use crate::middleware::Principal;
use crate::rag::RagRequest;
use crate::state::AppState;

/// Stored as the transcript entry when the answering service fails.
pub const RAG_APOLOGY: &str = "Something went wrong while asking the assistant. Please try again later.";

/// Transcript with each message's feedback attached.
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Envelope<Vec<MessageResponse>>>, ApiError> {
    let db = state.clone();
    let user_id = principal.id();
    let loaded = tokio::task::spawn_blocking(move || {
        if db.db.active_membership(&conversation_id, &user_id)?.is_none() {
            return Ok::<_, anyhow::Error>(None);
        }
        let rows = db.db.list_messages(&conversation_id)?;
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let feedback = db.db.feedback_for_messages(&ids)?;
        Ok(Some((rows, feedback)))
    })
    .await??;
    let (rows, feedback_rows) = loaded.ok_or(ApiError::ConversationNotFound)?;

    let mut feedback: HashMap<String, Vec<FeedbackResponse>> = HashMap::new();
    for row in feedback_rows {
        feedback.entry(row.message_id.clone()).or_default().push(convert::feedback(row));
    }

    let messages = rows
        .into_iter()
        .map(|row| {
            let fb = feedback.remove(&row.id).unwrap_or_default();
            convert::message(row, Some(fb))
        })
        .collect();
    Ok(Json(Envelope::new(messages)))
}

pub async fn post_message(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(conversation_id): Path<String>,
    Payload(req): Payload<PostMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = match &req.content {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(ApiError::InvalidContent),
    };

    let caller = principal.id();
    if !is_member(&state, &conversation_id, &caller).await? {
        return Err(ApiError::ConversationNotFound);
    }

    let sender = match req.sender.as_deref() {
        None => SenderKind::User,
        Some(raw) => raw.parse::<SenderKind>().map_err(|_| ApiError::InvalidSender)?,
    };
    let latency_ms = req.latency_ms.as_ref().map(parse_latency).transpose()?;

    let sender_user_id = match (sender, req.sender_user_id) {
        (SenderKind::User, _) => Some(caller.clone()),
        (_, Some(other)) if other != principal.user_id => {
            let other = other.to_string();
            if !is_member(&state, &conversation_id, &other).await? {
                return Err(ApiError::InvalidSenderUser);
            }
            Some(other)
        }
        (_, Some(_)) => Some(caller.clone()),
        (_, None) => None,
    };

    let row = append(&state, conversation_id, sender, sender_user_id, content, latency_ms, None).await?;
    Ok((StatusCode::CREATED, Json(Envelope::new(convert::message(row, None)))))
}

/// One question/answer turn against the answering service.
///
/// The question is stored before the call and is never rolled back. The
/// outcome is always appended afterwards: a bot answer, or a system apology
/// carrying the error in its metadata.
pub async fn ask(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(conversation_id): Path<String>,
    Payload(req): Payload<AskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = RagRequest::build(req.question.as_deref(), req.k, req.evaluate, state.rag.defaults())
        .map_err(|e| ApiError::InvalidRequest(e.message))?;

    let caller = principal.id();
    if !is_member(&state, &conversation_id, &caller).await? {
        return Err(ApiError::ConversationNotFound);
    }

    let question = append(
        &state,
        conversation_id.clone(),
        SenderKind::User,
        Some(caller),
        request.question.clone(),
        None,
        None,
    )
    .await?;

    match state.rag.answer(&request).await {
        Ok(answer) => {
            let metadata = json!({
                "rag": {
                    "request": request,
                    "response": { "sources": answer.sources, "evaluation": answer.evaluation },
                    "raw": answer.raw,
                }
            });
            let bot = append(
                &state,
                conversation_id,
                SenderKind::Bot,
                None,
                answer.answer,
                Some(answer.latency_ms),
                Some(metadata.to_string()),
            )
            .await?;
            info!(conversation_id = %bot.conversation_id, latency_ms = answer.latency_ms, "RAG answer stored");

            Ok((
                StatusCode::CREATED,
                Json(Envelope::new(AskResponse {
                    user: convert::message(question, None),
                    bot: convert::message(bot, None),
                })),
            ))
        }
        Err(err) => {
            warn!(%conversation_id, status = ?err.status, "RAG call failed: {}", err.message);
            let metadata = json!({
                "rag": {
                    "request": request,
                    "error": { "message": err.message, "status": err.status, "details": err.details },
                }
            });
            if let Err(e) = append(
                &state,
                conversation_id,
                SenderKind::System,
                None,
                RAG_APOLOGY.to_string(),
                None,
                Some(metadata.to_string()),
            )
            .await
            {
                error!("Failed to record RAG failure: {}", e);
            }

            Err(if err.is_client_fault() {
                ApiError::RagInvalidRequest(err.message)
            } else {
                ApiError::RagUnavailable(err.message)
            })
        }
    }
}

async fn is_member(state: &AppState, conversation_id: &str, user_id: &str) -> Result<bool, ApiError> {
    let db = state.clone();
    let (conversation_id, user_id) = (conversation_id.to_string(), user_id.to_string());
    let membership =
        tokio::task::spawn_blocking(move || db.db.active_membership(&conversation_id, &user_id)).await??;
    Ok(membership.is_some())
}

async fn append(
    state: &AppState,
    conversation_id: String,
    sender: SenderKind,
    sender_user_id: Option<String>,
    content: String,
    latency_ms: Option<i64>,
    metadata: Option<String>,
) -> Result<MessageRow, ApiError> {
    let db = state.clone();
    let row = tokio::task::spawn_blocking(move || {
        let id = Uuid::new_v4().to_string();
        db.db.insert_message(
            &NewMessage {
                id: &id,
                conversation_id: &conversation_id,
                sender_user_id: sender_user_id.as_deref(),
                sender,
                content: &content,
                latency_ms,
                metadata: metadata.as_deref(),
            },
            &timestamp(Utc::now()),
        )
    })
    .await??;
    Ok(row)
}

/// Non-negative finite number, or a string holding one. Rounded to whole ms.
fn parse_latency(raw: &Value) -> Result<i64, ApiError> {
    let value = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as i64)
        .ok_or(ApiError::InvalidLatency)
}
