use axum::{
    Extension, Json,
    extract::{Path, State},
};
use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use ragchat_db::timestamp;
use ragchat_types::api::{Envelope, FeedbackRequest, FeedbackResponse};

use crate::convert;
use crate::error::{ApiError, Payload};
use crate::middleware::Principal;
use crate::state::AppState;

/// Rate a message. A second rating from the same user replaces the first.
pub async fn rate_message(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(message_id): Path<String>,
    Payload(req): Payload<FeedbackRequest>,
) -> Result<Json<Envelope<FeedbackResponse>>, ApiError> {
    let rating = req.rating.as_ref().and_then(parse_rating).ok_or(ApiError::InvalidRating)?;
    let comment = req.comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());

    let db = state.clone();
    let user_id = principal.id();
    let row = tokio::task::spawn_blocking(move || {
        if !db.db.message_visible_to(&message_id, &user_id)? {
            return Ok::<_, anyhow::Error>(None);
        }
        let id = Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());
        db.db
            .upsert_feedback(&id, &message_id, &user_id, rating, comment.as_deref(), &now)
            .map(Some)
    })
    .await??
    .ok_or(ApiError::MessageNotFound)?;

    debug!(message_id = %row.message_id, rating, "Feedback stored");
    Ok(Json(Envelope::new(convert::feedback(row))))
}

/// Integer 1..=5, given as a JSON number or a numeric string.
fn parse_rating(raw: &Value) -> Option<u8> {
    let value = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (value.fract() == 0.0 && (1.0..=5.0).contains(&value)).then_some(value as u8)
}
